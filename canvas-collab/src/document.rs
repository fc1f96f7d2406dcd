//! Replicated canvas document backed by a Yrs CRDT.
//!
//! Layout inside the Yrs `Doc`:
//! ```text
//! shapes : Map<shape_id, json(Shape)>
//! groups : Map<group_id, json(Group)>
//! meta   : Map<"document", json(Metadata)>
//! ```
//!
//! Every mutation runs inside one Yrs transaction. On commit the document
//! stamps `lastModified`, encodes the transaction's v1 update (the delta),
//! records one undo item, and fires each observer list at most once.
//!
//! A typed mirror of the three maps is kept alongside the CRDT. Remote
//! updates are merged by Yrs, after which the mirror is rebuilt and diffed
//! to produce change events and per-record last-writer origins.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::model::{
    now_millis, Group, GroupPatch, Metadata, Shape, ShapePatch, ValidationError, MIN_GROUP_SIZE,
};
use crate::observer::{Observers, Subscription};
use crate::undo::{Change, EntryKey, StackKind, StackSizes, UndoConfig, UndoManager};

const SHAPES_ROOT: &str = "shapes";
const GROUPS_ROOT: &str = "groups";
const META_ROOT: &str = "meta";
const META_KEY: &str = "document";

/// Stable identifier of the replica that authored a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OriginId(pub Uuid);

impl OriginId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Origin used when the author of a merged delta is unknown,
    /// e.g. while replaying a persisted log.
    pub fn unknown() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for OriginId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A single document mutation, used by `batch_update` and the batching layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    AddShape(Shape),
    UpdateShape { id: String, patch: ShapePatch },
    DeleteShape(String),
    AddGroup(Group),
    UpdateGroup { id: String, patch: GroupPatch },
    DeleteGroup(String),
}

impl Operation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Operation::AddShape(shape) => shape.validate(),
            Operation::UpdateShape { patch, .. } => patch.validate(),
            Operation::AddGroup(group) => group.validate(),
            Operation::UpdateGroup { patch, .. } => patch.validate(),
            Operation::DeleteShape(_) | Operation::DeleteGroup(_) => Ok(()),
        }
    }

    /// The record this operation targets.
    pub fn target(&self) -> EntryKey {
        match self {
            Operation::AddShape(shape) => EntryKey::Shape(shape.id.clone()),
            Operation::UpdateShape { id, .. } | Operation::DeleteShape(id) => {
                EntryKey::Shape(id.clone())
            }
            Operation::AddGroup(group) => EntryKey::Group(group.id.clone()),
            Operation::UpdateGroup { id, .. } | Operation::DeleteGroup(id) => {
                EntryKey::Group(id.clone())
            }
        }
    }

    /// Fold `later` into `self` when both are updates of the same record.
    /// Returns `later` back when the two cannot be combined.
    pub fn coalesce(&mut self, later: Operation) -> Result<(), Operation> {
        match (self, later) {
            (
                Operation::UpdateShape { id, patch },
                Operation::UpdateShape { id: next_id, patch: next },
            ) if *id == next_id => {
                patch.merge(next);
                Ok(())
            }
            (
                Operation::UpdateGroup { id, patch },
                Operation::UpdateGroup { id: next_id, patch: next },
            ) if *id == next_id => {
                patch.merge(next);
                Ok(())
            }
            (_, later) => Err(later),
        }
    }

    pub(crate) fn apply(self, txn: &mut DocumentTxn<'_>) -> Result<(), ValidationError> {
        match self {
            Operation::AddShape(shape) => txn.add_shape(shape),
            Operation::UpdateShape { id, patch } => txn.update_shape(&id, &patch).map(|_| ()),
            Operation::DeleteShape(id) => {
                txn.delete_shape(&id);
                Ok(())
            }
            Operation::AddGroup(group) => txn.add_group(group),
            Operation::UpdateGroup { id, patch } => txn.update_group(&id, &patch).map(|_| ()),
            Operation::DeleteGroup(id) => {
                txn.delete_group(&id);
                Ok(())
            }
        }
    }
}

/// Ids touched by one committed transaction, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordChanges {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl RecordChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn push<T>(&mut self, id: &str, before: &Option<T>, after: &Option<T>) {
        match (before, after) {
            (None, Some(_)) => self.added.push(id.to_string()),
            (Some(_), Some(_)) => self.updated.push(id.to_string()),
            (Some(_), None) => self.removed.push(id.to_string()),
            (None, None) => {}
        }
    }

    fn sort(&mut self) {
        self.added.sort();
        self.updated.sort();
        self.removed.sort();
    }
}

/// Fired once per committed transaction that touched records.
#[derive(Debug, Clone)]
pub struct RecordsEvent {
    pub origin: OriginId,
    pub local: bool,
    pub changes: RecordChanges,
}

#[derive(Debug, Clone)]
pub struct MetaEvent {
    pub origin: OriginId,
    pub local: bool,
    pub metadata: Metadata,
}

/// A committed delta: local transactions and merged remote updates alike.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub origin: OriginId,
    pub local: bool,
    pub delta: Arc<Vec<u8>>,
}

/// A remote delta could not be merged. Existing state is left untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeError {
    Decode(String),
    Apply(String),
    StateVector(String),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::Decode(e) => write!(f, "Malformed delta: {e}"),
            MergeError::Apply(e) => write!(f, "Delta rejected by CRDT: {e}"),
            MergeError::StateVector(e) => write!(f, "Malformed state vector: {e}"),
        }
    }
}

impl std::error::Error for MergeError {}

struct Roots {
    shapes: MapRef,
    groups: MapRef,
    meta: MapRef,
}

#[derive(Default)]
struct Mirror {
    shapes: HashMap<String, Shape>,
    groups: HashMap<String, Group>,
    meta: Option<Metadata>,
}

#[derive(Default)]
struct DocumentObservers {
    shapes: Observers<RecordsEvent>,
    groups: Observers<RecordsEvent>,
    meta: Observers<MetaEvent>,
    updates: Observers<UpdateEvent>,
}

struct Committed {
    changes: Vec<Change>,
    delta: Vec<u8>,
    meta: Metadata,
}

/// How a committed local transaction enters the history.
#[derive(Clone, Copy)]
enum HistoryMode {
    Record,
    Push(StackKind),
    /// Follow-up of a remote merge: no undo item, records stay owned by
    /// the merged origin.
    Merged(OriginId),
}

struct MergeOutcome {
    changed: bool,
    touched_membership: bool,
}

/// The replicated document.
pub struct Document {
    doc: Doc,
    roots: Roots,
    mirror: Mirror,
    origin: OriginId,
    /// Origin of the most recent write to each record.
    writers: HashMap<EntryKey, OriginId>,
    history: UndoManager,
    observers: DocumentObservers,
}

impl Document {
    pub fn new(origin: OriginId) -> Self {
        Self::with_undo_config(origin, UndoConfig::default())
    }

    pub fn with_undo_config(origin: OriginId, undo: UndoConfig) -> Self {
        let doc = Doc::new();
        let roots = Roots {
            shapes: doc.get_or_insert_map(SHAPES_ROOT),
            groups: doc.get_or_insert_map(GROUPS_ROOT),
            meta: doc.get_or_insert_map(META_ROOT),
        };
        Self {
            doc,
            roots,
            mirror: Mirror::default(),
            origin,
            writers: HashMap::new(),
            history: UndoManager::new(origin, undo),
            observers: DocumentObservers::default(),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn get_shape(&self, id: &str) -> Option<Shape> {
        self.mirror.shapes.get(id).cloned()
    }

    /// All shapes, ordered by creation time then id.
    pub fn get_all_shapes(&self) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = self.mirror.shapes.values().cloned().collect();
        shapes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        shapes
    }

    pub fn get_group(&self, id: &str) -> Option<Group> {
        self.mirror.groups.get(id).cloned()
    }

    pub fn get_all_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.mirror.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    pub fn metadata(&self) -> Option<Metadata> {
        self.mirror.meta
    }

    pub fn shape_count(&self) -> usize {
        self.mirror.shapes.len()
    }

    pub fn group_count(&self) -> usize {
        self.mirror.groups.len()
    }

    /// Origin of the most recent write to a shape, if any.
    pub fn last_writer(&self, key: &EntryKey) -> Option<OriginId> {
        self.writers.get(key).copied()
    }

    // ─── Local mutations ──────────────────────────────────────────────

    pub fn add_shape(&mut self, shape: Shape) -> Result<(), ValidationError> {
        shape.validate()?;
        self.transact(|txn| txn.add_shape(shape))
    }

    /// Returns `Ok(false)` when the shape does not exist.
    pub fn update_shape(&mut self, id: &str, patch: ShapePatch) -> Result<bool, ValidationError> {
        patch.validate()?;
        self.transact(|txn| txn.update_shape(id, &patch))
    }

    pub fn delete_shape(&mut self, id: &str) -> bool {
        self.transact(|txn| txn.delete_shape(id))
    }

    pub fn add_group(&mut self, group: Group) -> Result<(), ValidationError> {
        group.validate()?;
        self.transact(|txn| txn.add_group(group))
    }

    pub fn update_group(&mut self, id: &str, patch: GroupPatch) -> Result<bool, ValidationError> {
        patch.validate()?;
        self.transact(|txn| txn.update_group(id, &patch))
    }

    pub fn delete_group(&mut self, id: &str) -> bool {
        self.transact(|txn| txn.delete_group(id))
    }

    /// Apply several operations in one atomic transaction.
    ///
    /// All operations are validated first; if any is malformed nothing is
    /// applied.
    pub fn batch_update(&mut self, ops: Vec<Operation>) -> Result<(), ValidationError> {
        for op in &ops {
            op.validate()?;
        }
        self.transact(|txn| ops.into_iter().try_for_each(|op| op.apply(txn)))
    }

    /// Remove dangling member ids and groups left with fewer than two members.
    /// Returns the number of groups rewritten or removed.
    pub fn cleanup_groups(&mut self) -> usize {
        self.transact(|txn| txn.cleanup_groups())
    }

    /// Run `f` inside one local transaction.
    pub fn transact<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut DocumentTxn<'_>) -> R,
    {
        self.run_local(HistoryMode::Record, f)
    }

    fn run_local<R, F>(&mut self, mode: HistoryMode, f: F) -> R
    where
        F: FnOnce(&mut DocumentTxn<'_>) -> R,
    {
        let now = now_millis();
        let (result, committed) = {
            let mut txn = DocumentTxn {
                txn: self.doc.transact_mut(),
                roots: &self.roots,
                mirror: &mut self.mirror,
                changes: Vec::new(),
                wrote: false,
                now,
            };
            let result = f(&mut txn);
            (result, txn.commit())
        };

        if let Some(committed) = committed {
            self.after_local_commit(committed, mode);
        }
        result
    }

    fn after_local_commit(&mut self, committed: Committed, mode: HistoryMode) {
        let Committed {
            changes,
            delta,
            meta,
        } = committed;

        let writer = match mode {
            HistoryMode::Merged(origin) => origin,
            _ => self.origin,
        };
        for change in &changes {
            self.writers.insert(change.key(), writer);
        }

        let (shapes, groups) = split_changes(&changes);
        match mode {
            HistoryMode::Record => self.history.record(changes),
            HistoryMode::Push(kind) => self.history.push(kind, changes),
            HistoryMode::Merged(_) => {}
        }

        let origin = self.origin;
        self.notify(origin, true, shapes, groups, Some(meta));
        self.observers.updates.notify(&UpdateEvent {
            origin,
            local: true,
            delta: Arc::new(delta),
        });
    }

    fn notify(
        &self,
        origin: OriginId,
        local: bool,
        shapes: RecordChanges,
        groups: RecordChanges,
        meta: Option<Metadata>,
    ) {
        if !shapes.is_empty() {
            self.observers.shapes.notify(&RecordsEvent {
                origin,
                local,
                changes: shapes,
            });
        }
        if !groups.is_empty() {
            self.observers.groups.notify(&RecordsEvent {
                origin,
                local,
                changes: groups,
            });
        }
        if let Some(metadata) = meta {
            self.observers.meta.notify(&MetaEvent {
                origin,
                local,
                metadata,
            });
        }
    }

    // ─── Undo / redo ──────────────────────────────────────────────────

    /// Revert the most recent local transaction.
    ///
    /// Records whose latest write came from another origin are left alone.
    /// Returns `true` when an item existed and at least one record was
    /// reverted.
    pub fn undo(&mut self) -> bool {
        self.replay(StackKind::Undo)
    }

    pub fn redo(&mut self) -> bool {
        self.replay(StackKind::Redo)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn stack_sizes(&self) -> StackSizes {
        self.history.sizes()
    }

    pub fn on_stack_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StackSizes) + Send + Sync + 'static,
    {
        self.history.on_stack_change(callback)
    }

    fn replay(&mut self, from: StackKind) -> bool {
        let sizes_before = self.history.sizes();
        let Some(item) = self.history.pop(from) else {
            return false;
        };

        let revertible: Vec<Change> = item
            .changes
            .into_iter()
            .rev()
            .filter(|change| self.writers.get(&change.key()) == Some(&item.origin))
            .collect();

        let target = match from {
            StackKind::Undo => StackKind::Redo,
            StackKind::Redo => StackKind::Undo,
        };

        let applied = if revertible.is_empty() {
            false
        } else {
            self.run_local(HistoryMode::Push(target), |txn| {
                revertible.iter().for_each(|change| txn.restore(change));
                txn.has_changes()
            })
        };

        if !applied {
            log::debug!("{from:?} item skipped: every record was overwritten by another origin");
        }
        self.history.notify_if_changed(sizes_before);
        applied
    }

    // ─── Remote merge ─────────────────────────────────────────────────

    /// Merge a delta produced by another replica.
    ///
    /// Safe to call with duplicated or reordered deltas. Returns whether any
    /// record visibly changed.
    ///
    /// The update event fires only when the merge added or deleted something
    /// or left parts of the delta waiting for missing dependencies, so a
    /// redelivered delta is not reported twice. When the merge removed a
    /// shape or touched a group, groups left with dangling or too few members
    /// are cleaned up in a follow-up local transaction.
    pub fn apply_update(&mut self, update: &[u8], origin: OriginId) -> Result<bool, MergeError> {
        let decoded = Update::decode_v1(update).map_err(|e| MergeError::Decode(e.to_string()))?;
        let advanced = {
            let mut txn = self.doc.transact_mut();
            let before = txn.snapshot();
            txn.apply_update(decoded)
                .map_err(|e| MergeError::Apply(e.to_string()))?;
            txn.snapshot() != before || txn.has_missing_updates()
        };

        let merge = self.refresh_from_crdt(origin);
        if advanced {
            self.observers.updates.notify(&UpdateEvent {
                origin,
                local: false,
                delta: Arc::new(update.to_vec()),
            });
        } else {
            log::trace!("Merged delta from {origin} carried nothing new");
        }

        if merge.touched_membership && self.has_stale_groups() {
            let cleaned = self.run_local(HistoryMode::Merged(origin), |txn| txn.cleanup_groups());
            log::debug!("Cleaned {cleaned} group(s) after merging from {origin}");
        }
        Ok(merge.changed)
    }

    fn has_stale_groups(&self) -> bool {
        self.mirror.groups.values().any(|g| {
            g.shape_ids.len() < MIN_GROUP_SIZE
                || g.shape_ids.iter().any(|s| !self.mirror.shapes.contains_key(s))
        })
    }

    fn refresh_from_crdt(&mut self, origin: OriginId) -> MergeOutcome {
        let (shapes, groups, meta) = {
            let txn = self.doc.transact();
            (
                read_records::<Shape, _>(&self.roots.shapes, &txn),
                read_records::<Group, _>(&self.roots.groups, &txn),
                read_meta(&self.roots.meta, &txn),
            )
        };

        let shape_changes = diff_records(&self.mirror.shapes, &shapes);
        let group_changes = diff_records(&self.mirror.groups, &groups);
        let meta_changed = meta != self.mirror.meta;

        for id in shape_changes.touched() {
            self.writers.insert(EntryKey::Shape(id.clone()), origin);
        }
        for id in group_changes.touched() {
            self.writers.insert(EntryKey::Group(id.clone()), origin);
        }

        self.mirror = Mirror {
            shapes,
            groups,
            meta,
        };

        let outcome = MergeOutcome {
            changed: !shape_changes.is_empty() || !group_changes.is_empty() || meta_changed,
            touched_membership: !shape_changes.removed.is_empty() || !group_changes.is_empty(),
        };
        let meta_event = if meta_changed { meta } else { None };
        self.notify(origin, false, shape_changes, group_changes, meta_event);
        outcome
    }

    // ─── State exchange ───────────────────────────────────────────────

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Encode everything this replica has that `remote_state_vector` lacks.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| MergeError::StateVector(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Encode the full document state as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    // ─── Observers ────────────────────────────────────────────────────

    pub fn on_shapes_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RecordsEvent) + Send + Sync + 'static,
    {
        self.observers.shapes.subscribe(callback)
    }

    pub fn on_groups_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RecordsEvent) + Send + Sync + 'static,
    {
        self.observers.groups.subscribe(callback)
    }

    pub fn on_meta_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MetaEvent) + Send + Sync + 'static,
    {
        self.observers.meta.subscribe(callback)
    }

    /// Every committed delta, local or merged. Used by transports and
    /// persistence.
    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.observers.updates.subscribe(callback)
    }
}

/// Mutation handle for one open transaction.
pub struct DocumentTxn<'a> {
    txn: TransactionMut<'a>,
    roots: &'a Roots,
    mirror: &'a mut Mirror,
    changes: Vec<Change>,
    /// Whether the CRDT itself was written, even if values ended up equal.
    wrote: bool,
    now: u64,
}

impl<'a> DocumentTxn<'a> {
    pub fn shape(&self, id: &str) -> Option<&Shape> {
        self.mirror.shapes.get(id)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.mirror.groups.get(id)
    }

    /// Insert a shape, replacing any record with the same id.
    pub fn add_shape(&mut self, mut shape: Shape) -> Result<(), ValidationError> {
        shape.validate()?;
        shape.updated_at = self.now;
        self.write_shape(shape)
    }

    pub fn update_shape(&mut self, id: &str, patch: &ShapePatch) -> Result<bool, ValidationError> {
        patch.validate()?;
        let Some(current) = self.mirror.shapes.get(id) else {
            return Ok(false);
        };
        let mut next = current.clone();
        next.apply(patch);
        next.updated_at = self.now;
        self.write_shape(next)?;
        Ok(true)
    }

    /// Delete a shape and scrub it from every group. Deleting twice is a no-op.
    pub fn delete_shape(&mut self, id: &str) -> bool {
        if !self.remove_shape(id) {
            return false;
        }

        let affected: Vec<Group> = self
            .mirror
            .groups
            .values()
            .filter(|g| g.shape_ids.iter().any(|s| s == id))
            .cloned()
            .collect();
        for mut group in affected {
            group.shape_ids.retain(|s| s != id);
            self.rewrite_or_drop_group(group);
        }
        true
    }

    /// Insert a group and point its member shapes at it.
    pub fn add_group(&mut self, mut group: Group) -> Result<(), ValidationError> {
        group.validate()?;
        group.updated_at = self.now;
        let members = group.shape_ids.clone();
        let group_id = group.id.clone();
        self.write_group(group)?;
        self.link_members(&group_id, &members);
        Ok(())
    }

    pub fn update_group(&mut self, id: &str, patch: &GroupPatch) -> Result<bool, ValidationError> {
        patch.validate()?;
        let Some(current) = self.mirror.groups.get(id) else {
            return Ok(false);
        };
        let previous_members = current.shape_ids.clone();
        let mut next = current.clone();
        next.apply(patch);
        next.updated_at = self.now;

        let dropped: Vec<String> = previous_members
            .iter()
            .filter(|s| !next.shape_ids.contains(s))
            .cloned()
            .collect();
        let members = next.shape_ids.clone();
        self.write_group(next)?;
        self.unlink_members(id, &dropped);
        self.link_members(id, &members);
        Ok(true)
    }

    pub fn delete_group(&mut self, id: &str) -> bool {
        let Some(members) = self.mirror.groups.get(id).map(|g| g.shape_ids.clone()) else {
            return false;
        };
        self.remove_group(id);
        self.unlink_members(id, &members);
        true
    }

    /// Scrub dangling member ids; drop groups with fewer than two members left.
    pub fn cleanup_groups(&mut self) -> usize {
        let stale: Vec<Group> = self
            .mirror
            .groups
            .values()
            .filter(|g| {
                g.shape_ids.len() < MIN_GROUP_SIZE
                    || g.shape_ids.iter().any(|s| !self.mirror.shapes.contains_key(s))
            })
            .cloned()
            .collect();

        let count = stale.len();
        for mut group in stale {
            group
                .shape_ids
                .retain(|s| self.mirror.shapes.contains_key(s));
            self.rewrite_or_drop_group(group);
        }
        count
    }

    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| !c.is_noop())
    }

    fn rewrite_or_drop_group(&mut self, mut group: Group) {
        if group.shape_ids.len() < MIN_GROUP_SIZE {
            let id = group.id.clone();
            let members = group.shape_ids.clone();
            self.remove_group(&id);
            self.unlink_members(&id, &members);
        } else {
            group.updated_at = self.now;
            if let Err(e) = self.write_group(group) {
                log::error!("Group rewrite failed during cleanup: {e}");
            }
        }
    }

    fn link_members(&mut self, group_id: &str, members: &[String]) {
        for shape_id in members {
            let Some(shape) = self.mirror.shapes.get(shape_id) else {
                continue;
            };
            if shape.group_id.as_deref() == Some(group_id) {
                continue;
            }
            let mut shape = shape.clone();
            shape.group_id = Some(group_id.to_string());
            shape.updated_at = self.now;
            if let Err(e) = self.write_shape(shape) {
                log::error!("Failed to link shape {shape_id} to group {group_id}: {e}");
            }
        }
    }

    fn unlink_members(&mut self, group_id: &str, members: &[String]) {
        for shape_id in members {
            let Some(shape) = self.mirror.shapes.get(shape_id) else {
                continue;
            };
            if shape.group_id.as_deref() != Some(group_id) {
                continue;
            }
            let mut shape = shape.clone();
            shape.group_id = None;
            shape.updated_at = self.now;
            if let Err(e) = self.write_shape(shape) {
                log::error!("Failed to unlink shape {shape_id} from group {group_id}: {e}");
            }
        }
    }

    /// Put a record back to the value captured in `change.before`.
    fn restore(&mut self, change: &Change) {
        let result = match change {
            Change::Shape { id, before, .. } => match before {
                Some(shape) => {
                    let mut shape = shape.clone();
                    shape.updated_at = self.now;
                    self.write_shape(shape)
                }
                None => {
                    self.remove_shape(id);
                    Ok(())
                }
            },
            Change::Group { id, before, .. } => match before {
                Some(group) => {
                    let mut group = group.clone();
                    group.updated_at = self.now;
                    self.write_group(group)
                }
                None => {
                    self.remove_group(id);
                    Ok(())
                }
            },
        };
        if let Err(e) = result {
            log::error!("Failed to restore {:?}: {e}", change.key());
        }
    }

    fn write_shape(&mut self, shape: Shape) -> Result<(), ValidationError> {
        let json = encode_record(&shape)?;
        self.roots.shapes.insert(&mut self.txn, shape.id.clone(), json);
        self.wrote = true;
        let id = shape.id.clone();
        let before = self.mirror.shapes.insert(id.clone(), shape.clone());
        self.push_change(Change::Shape {
            id,
            before,
            after: Some(shape),
        });
        Ok(())
    }

    fn remove_shape(&mut self, id: &str) -> bool {
        let Some(before) = self.mirror.shapes.remove(id) else {
            return false;
        };
        self.roots.shapes.remove(&mut self.txn, id);
        self.wrote = true;
        self.push_change(Change::Shape {
            id: id.to_string(),
            before: Some(before),
            after: None,
        });
        true
    }

    fn write_group(&mut self, group: Group) -> Result<(), ValidationError> {
        let json = encode_record(&group)?;
        self.roots.groups.insert(&mut self.txn, group.id.clone(), json);
        self.wrote = true;
        let id = group.id.clone();
        let before = self.mirror.groups.insert(id.clone(), group.clone());
        self.push_change(Change::Group {
            id,
            before,
            after: Some(group),
        });
        Ok(())
    }

    fn remove_group(&mut self, id: &str) -> bool {
        let Some(before) = self.mirror.groups.remove(id) else {
            return false;
        };
        self.roots.groups.remove(&mut self.txn, id);
        self.wrote = true;
        self.push_change(Change::Group {
            id: id.to_string(),
            before: Some(before),
            after: None,
        });
        true
    }

    fn push_change(&mut self, change: Change) {
        let key = change.key();
        match self.changes.iter_mut().find(|c| c.key() == key) {
            Some(existing) => existing.absorb(change),
            None => self.changes.push(change),
        }
    }

    /// Stamp metadata, encode the delta and release the Yrs transaction.
    fn commit(self) -> Option<Committed> {
        let DocumentTxn {
            mut txn,
            roots,
            mirror,
            mut changes,
            wrote,
            now,
        } = self;

        if !wrote {
            return None;
        }

        let mut meta = mirror.meta.unwrap_or_else(|| Metadata::new(now));
        meta.touch(now);
        match serde_json::to_string(&meta) {
            Ok(json) => {
                roots.meta.insert(&mut txn, META_KEY, json);
                mirror.meta = Some(meta);
            }
            Err(e) => log::error!("Failed to encode document metadata: {e}"),
        }

        changes.retain(|c| !c.is_noop());
        let delta = txn.encode_update_v1();
        drop(txn);

        Some(Committed {
            changes,
            delta,
            meta,
        })
    }
}

impl RecordChanges {
    fn touched(&self) -> impl Iterator<Item = &String> {
        self.added
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
    }
}

fn encode_record<T: Serialize>(record: &T) -> Result<String, ValidationError> {
    serde_json::to_string(record).map_err(|e| ValidationError::Unencodable(e.to_string()))
}

fn split_changes(changes: &[Change]) -> (RecordChanges, RecordChanges) {
    let mut shapes = RecordChanges::default();
    let mut groups = RecordChanges::default();
    for change in changes {
        match change {
            Change::Shape { id, before, after } => shapes.push(id, before, after),
            Change::Group { id, before, after } => groups.push(id, before, after),
        }
    }
    shapes.sort();
    groups.sort();
    (shapes, groups)
}

fn diff_records<T: PartialEq>(
    old: &HashMap<String, T>,
    new: &HashMap<String, T>,
) -> RecordChanges {
    let mut changes = RecordChanges::default();
    for (id, record) in new {
        match old.get(id) {
            None => changes.added.push(id.clone()),
            Some(previous) if previous != record => changes.updated.push(id.clone()),
            Some(_) => {}
        }
    }
    for id in old.keys() {
        if !new.contains_key(id) {
            changes.removed.push(id.clone());
        }
    }
    changes.sort();
    changes
}

fn read_records<T, R>(map: &MapRef, txn: &R) -> HashMap<String, T>
where
    T: DeserializeOwned,
    R: ReadTxn,
{
    let mut records = HashMap::new();
    for (key, value) in map.iter(txn) {
        match value {
            Out::Any(Any::String(json)) => match serde_json::from_str::<T>(&json) {
                Ok(record) => {
                    records.insert(key.to_string(), record);
                }
                Err(e) => log::warn!("Skipping undecodable record {key}: {e}"),
            },
            _ => log::warn!("Skipping non-JSON entry {key}"),
        }
    }
    records
}

fn read_meta<R: ReadTxn>(map: &MapRef, txn: &R) -> Option<Metadata> {
    match map.get(txn, META_KEY)? {
        Out::Any(Any::String(json)) => serde_json::from_str(&json)
            .map_err(|e| log::warn!("Undecodable document metadata: {e}"))
            .ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bounds, Point, ShapeKind, Size};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn rect(id: &str, x: f64, y: f64) -> Shape {
        Shape::new(id, ShapeKind::Rectangle, Point::new(x, y), Size::new(10.0, 10.0))
    }

    fn circle(id: &str, x: f64, y: f64) -> Shape {
        Shape::new(id, ShapeKind::Circle, Point::new(x, y), Size::new(5.0, 5.0))
    }

    fn group(id: &str, members: &[&str]) -> Group {
        Group::new(
            id,
            members.iter().map(|m| m.to_string()).collect(),
            Bounds::default(),
        )
    }

    /// Capture every local delta a document emits.
    fn capture(doc: &Document) -> (Arc<Mutex<Vec<Vec<u8>>>>, Subscription) {
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let sink = deltas.clone();
        let sub = doc.on_update(move |event| {
            if event.local {
                sink.lock().unwrap().push(event.delta.to_vec());
            }
        });
        (deltas, sub)
    }

    fn ids(shapes: &[Shape]) -> Vec<String> {
        let mut ids: Vec<String> = shapes.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_add_get_update_delete_shape() {
        let mut doc = Document::new(OriginId::generate());
        doc.add_shape(rect("s1", 10.0, 10.0)).unwrap();

        let stored = doc.get_shape("s1").unwrap();
        assert_eq!(stored.position, Point::new(10.0, 10.0));

        assert!(doc.update_shape("s1", ShapePatch::position(20.0, 30.0)).unwrap());
        assert_eq!(doc.get_shape("s1").unwrap().position, Point::new(20.0, 30.0));

        assert!(doc.delete_shape("s1"));
        assert!(doc.get_shape("s1").is_none());
        assert!(!doc.delete_shape("s1"), "second delete is a no-op");
    }

    #[test]
    fn test_missing_id_is_silent_noop() {
        let mut doc = Document::new(OriginId::generate());
        let (deltas, _sub) = capture(&doc);

        assert!(!doc.update_shape("ghost", ShapePatch::position(1.0, 1.0)).unwrap());
        assert!(!doc.delete_group("ghost"));
        assert!(deltas.lock().unwrap().is_empty());
        assert!(doc.metadata().is_none());
        assert!(!doc.can_undo());
    }

    #[test]
    fn test_validation_rejected_before_document() {
        let mut doc = Document::new(OriginId::generate());
        let mut bad = rect("s1", 0.0, 0.0);
        bad.position.y = f64::INFINITY;

        assert!(doc.add_shape(bad).is_err());
        assert_eq!(doc.shape_count(), 0);
        assert!(doc.metadata().is_none());

        let ops = vec![
            Operation::AddShape(rect("ok", 0.0, 0.0)),
            Operation::AddGroup(group("g", &["ok"])),
        ];
        assert!(doc.batch_update(ops).is_err());
        assert_eq!(doc.shape_count(), 0, "batch is all-or-nothing");
    }

    #[test]
    fn test_mutation_stamps_timestamps() {
        let mut doc = Document::new(OriginId::generate());
        let mut shape = rect("s1", 0.0, 0.0);
        shape.updated_at = 0;
        doc.add_shape(shape).unwrap();

        let first = doc.metadata().unwrap();
        assert!(doc.get_shape("s1").unwrap().updated_at > 0);

        doc.update_shape("s1", ShapePatch::position(1.0, 1.0)).unwrap();
        let second = doc.metadata().unwrap();
        assert!(second.last_modified >= first.last_modified);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_batch_fires_observers_once() {
        let mut doc = Document::new(OriginId::generate());
        let shape_events = Arc::new(AtomicUsize::new(0));
        let meta_events = Arc::new(AtomicUsize::new(0));

        let s = shape_events.clone();
        let _shapes = doc.on_shapes_change(move |event| {
            assert!(event.local);
            s.fetch_add(1, Ordering::SeqCst);
        });
        let m = meta_events.clone();
        let _meta = doc.on_meta_change(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
        });

        doc.batch_update(vec![
            Operation::AddShape(rect("a", 0.0, 0.0)),
            Operation::AddShape(rect("b", 1.0, 1.0)),
            Operation::UpdateShape {
                id: "a".into(),
                patch: ShapePatch::position(5.0, 5.0),
            },
        ])
        .unwrap();

        assert_eq!(shape_events.load(Ordering::SeqCst), 1);
        assert_eq!(meta_events.load(Ordering::SeqCst), 1);
        assert_eq!(doc.stack_sizes().undo, 1);
        assert_eq!(doc.get_shape("a").unwrap().position, Point::new(5.0, 5.0));
    }

    #[test]
    fn test_convergence_any_order_with_duplicates() {
        let mut a = Document::new(OriginId::generate());
        let mut b = Document::new(OriginId::generate());
        let (a_deltas, _sa) = capture(&a);
        let (b_deltas, _sb) = capture(&b);

        a.add_shape(rect("s1", 10.0, 10.0)).unwrap();
        a.update_shape("s1", ShapePatch::position(12.0, 12.0)).unwrap();
        b.add_shape(circle("s2", 50.0, 50.0)).unwrap();
        b.add_shape(circle("s3", 60.0, 60.0)).unwrap();
        b.add_group(group("g1", &["s2", "s3"])).unwrap();

        let from_a = a_deltas.lock().unwrap().clone();
        let from_b = b_deltas.lock().unwrap().clone();

        // Reversed order and duplicates.
        for delta in from_b.iter().rev().chain(from_b.iter()) {
            a.apply_update(delta, b.origin()).unwrap();
        }
        for delta in from_a.iter().rev().chain(from_a.iter()) {
            b.apply_update(delta, a.origin()).unwrap();
        }

        assert_eq!(ids(&a.get_all_shapes()), vec!["s1", "s2", "s3"]);
        assert_eq!(a.get_all_shapes().len(), b.get_all_shapes().len());
        for shape in a.get_all_shapes() {
            assert_eq!(Some(shape.clone()), b.get_shape(&shape.id));
        }
        assert_eq!(a.get_all_groups(), b.get_all_groups());
        assert_eq!(a.get_shape("s1").unwrap().position, Point::new(12.0, 12.0));
    }

    #[test]
    fn test_concurrent_writes_same_shape_converge() {
        let mut a = Document::new(OriginId::generate());
        let mut b = Document::new(OriginId::generate());
        a.add_shape(rect("s1", 0.0, 0.0)).unwrap();
        b.apply_update(&a.encode_state_as_update(), a.origin()).unwrap();

        a.update_shape("s1", ShapePatch::position(1.0, 1.0)).unwrap();
        b.update_shape("s1", ShapePatch::position(2.0, 2.0)).unwrap();

        let a_state = a.encode_state_as_update();
        let b_state = b.encode_state_as_update();
        a.apply_update(&b_state, b.origin()).unwrap();
        b.apply_update(&a_state, a.origin()).unwrap();

        assert_eq!(a.get_shape("s1"), b.get_shape("s1"));
    }

    #[test]
    fn test_apply_same_delta_twice_is_idempotent() {
        let mut source = Document::new(OriginId::generate());
        let (deltas, _sub) = capture(&source);
        source.add_shape(rect("s1", 1.0, 2.0)).unwrap();
        let delta = deltas.lock().unwrap()[0].clone();

        let mut replica = Document::new(OriginId::generate());
        assert!(replica.apply_update(&delta, source.origin()).unwrap());
        let once = replica.get_all_shapes();
        assert!(!replica.apply_update(&delta, source.origin()).unwrap());
        assert_eq!(replica.get_all_shapes(), once);
    }

    #[test]
    fn test_malformed_delta_leaves_state_untouched() {
        let mut doc = Document::new(OriginId::generate());
        doc.add_shape(rect("s1", 0.0, 0.0)).unwrap();
        let before = doc.get_all_shapes();

        let result = doc.apply_update(&[0xFF, 0xFE, 0xFD, 0x00], OriginId::generate());
        assert!(result.is_err());
        assert_eq!(doc.get_all_shapes(), before);
    }

    #[test]
    fn test_state_vector_diff_sync() {
        let mut a = Document::new(OriginId::generate());
        let mut b = Document::new(OriginId::generate());
        a.add_shape(rect("s1", 10.0, 10.0)).unwrap();
        b.add_shape(circle("s2", 50.0, 50.0)).unwrap();

        let diff_for_b = a.encode_diff(&b.encode_state_vector()).unwrap();
        let diff_for_a = b.encode_diff(&a.encode_state_vector()).unwrap();
        b.apply_update(&diff_for_b, a.origin()).unwrap();
        a.apply_update(&diff_for_a, b.origin()).unwrap();

        assert_eq!(ids(&a.get_all_shapes()), vec!["s1", "s2"]);
        assert_eq!(ids(&b.get_all_shapes()), vec!["s1", "s2"]);
        assert!(a.encode_diff(&[0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_remote_merge_fires_remote_events() {
        let mut source = Document::new(OriginId::generate());
        source.add_shape(rect("s1", 0.0, 0.0)).unwrap();

        let mut replica = Document::new(OriginId::generate());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = replica.on_shapes_change(move |event| {
            s.lock().unwrap().push((event.local, event.changes.added.clone()));
        });

        replica
            .apply_update(&source.encode_state_as_update(), source.origin())
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(false, vec!["s1".to_string()])]);
        assert_eq!(
            replica.last_writer(&EntryKey::Shape("s1".into())),
            Some(source.origin())
        );
    }

    #[test]
    fn test_undo_redo_local_edit() {
        let mut doc = Document::new(OriginId::generate());
        doc.add_shape(rect("s1", 0.0, 0.0)).unwrap();
        doc.update_shape("s1", ShapePatch::position(9.0, 9.0)).unwrap();

        assert!(doc.undo());
        assert_eq!(doc.get_shape("s1").unwrap().position, Point::new(0.0, 0.0));
        assert!(doc.can_redo());

        assert!(doc.redo());
        assert_eq!(doc.get_shape("s1").unwrap().position, Point::new(9.0, 9.0));

        assert!(doc.undo());
        assert!(doc.undo());
        assert!(doc.get_shape("s1").is_none());
        assert!(!doc.undo());
        assert!(!doc.can_undo());
    }

    #[test]
    fn test_undo_batch_is_one_step() {
        let mut doc = Document::new(OriginId::generate());
        doc.batch_update(vec![
            Operation::AddShape(rect("a", 0.0, 0.0)),
            Operation::AddShape(rect("b", 0.0, 0.0)),
        ])
        .unwrap();

        assert!(doc.undo());
        assert_eq!(doc.shape_count(), 0);
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut doc = Document::new(OriginId::generate());
        doc.add_shape(rect("a", 0.0, 0.0)).unwrap();
        doc.undo();
        assert!(doc.can_redo());
        doc.add_shape(rect("b", 0.0, 0.0)).unwrap();
        assert!(!doc.can_redo());
    }

    #[test]
    fn test_undo_never_reverts_remote_write() {
        let mut local = Document::new(OriginId::generate());
        let mut remote = Document::new(OriginId::generate());
        let (local_deltas, _sl) = capture(&local);
        let (remote_deltas, _sr) = capture(&remote);

        local.add_shape(rect("s1", 0.0, 0.0)).unwrap();
        local.add_shape(rect("s2", 0.0, 0.0)).unwrap();
        for delta in local_deltas.lock().unwrap().drain(..) {
            remote.apply_update(&delta, local.origin()).unwrap();
        }

        local
            .batch_update(vec![
                Operation::UpdateShape {
                    id: "s1".into(),
                    patch: ShapePatch::position(5.0, 5.0),
                },
                Operation::UpdateShape {
                    id: "s2".into(),
                    patch: ShapePatch::position(5.0, 5.0),
                },
            ])
            .unwrap();
        for delta in local_deltas.lock().unwrap().drain(..) {
            remote.apply_update(&delta, local.origin()).unwrap();
        }

        // Remote participant moves s1 afterwards.
        remote.update_shape("s1", ShapePatch::position(77.0, 77.0)).unwrap();
        for delta in remote_deltas.lock().unwrap().drain(..) {
            local.apply_update(&delta, remote.origin()).unwrap();
        }

        assert!(local.undo());
        assert_eq!(local.get_shape("s1").unwrap().position, Point::new(77.0, 77.0));
        assert_eq!(local.get_shape("s2").unwrap().position, Point::new(0.0, 0.0));
    }

    #[test]
    fn test_undo_fully_superseded_returns_false() {
        let mut local = Document::new(OriginId::generate());
        let mut remote = Document::new(OriginId::generate());
        local.add_shape(rect("s1", 0.0, 0.0)).unwrap();
        remote
            .apply_update(&local.encode_state_as_update(), local.origin())
            .unwrap();
        remote.update_shape("s1", ShapePatch::position(3.0, 3.0)).unwrap();
        local
            .apply_update(&remote.encode_state_as_update(), remote.origin())
            .unwrap();

        assert!(local.can_undo());
        assert!(!local.undo());
        assert!(!local.can_undo());
        assert!(local.get_shape("s1").is_some());
    }

    #[test]
    fn test_stack_change_notifications() {
        let mut doc = Document::new(OriginId::generate());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = doc.on_stack_change(move |sizes| s.lock().unwrap().push(*sizes));

        doc.add_shape(rect("a", 0.0, 0.0)).unwrap();
        doc.undo();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&StackSizes { undo: 1, redo: 0 }));
        assert_eq!(seen.last(), Some(&StackSizes { undo: 0, redo: 1 }));
    }

    #[test]
    fn test_deleting_second_to_last_member_removes_group() {
        let mut doc = Document::new(OriginId::generate());
        doc.add_shape(rect("a", 0.0, 0.0)).unwrap();
        doc.add_shape(rect("b", 0.0, 0.0)).unwrap();
        doc.add_group(group("g1", &["a", "b"])).unwrap();
        assert_eq!(doc.get_shape("a").unwrap().group_id.as_deref(), Some("g1"));

        doc.delete_shape("a");
        assert!(doc.get_group("g1").is_none());
        assert_eq!(doc.get_shape("b").unwrap().group_id, None);
    }

    #[test]
    fn test_delete_member_shrinks_larger_group() {
        let mut doc = Document::new(OriginId::generate());
        for id in ["a", "b", "c"] {
            doc.add_shape(rect(id, 0.0, 0.0)).unwrap();
        }
        doc.add_group(group("g1", &["a", "b", "c"])).unwrap();

        doc.delete_shape("b");
        assert_eq!(doc.get_group("g1").unwrap().shape_ids, vec!["a", "c"]);

        assert!(doc.undo());
        assert_eq!(doc.get_group("g1").unwrap().shape_ids, vec!["a", "b", "c"]);
        assert!(doc.get_shape("b").is_some());
    }

    #[test]
    fn test_cleanup_removes_dangling_members() {
        let mut doc = Document::new(OriginId::generate());
        for id in ["a", "b", "c"] {
            doc.add_shape(rect(id, 0.0, 0.0)).unwrap();
        }
        doc.add_group(group("big", &["a", "b", "ghost"])).unwrap();
        doc.add_group(group("small", &["c", "phantom"])).unwrap();

        assert_eq!(doc.cleanup_groups(), 2);
        assert_eq!(doc.get_group("big").unwrap().shape_ids, vec!["a", "b"]);
        assert!(doc.get_group("small").is_none());
        assert_eq!(doc.cleanup_groups(), 0);
    }

    #[test]
    fn test_concurrent_member_deletes_drop_group() {
        let mut a = Document::new(OriginId::generate());
        for id in ["x", "y", "z"] {
            a.add_shape(rect(id, 0.0, 0.0)).unwrap();
        }
        a.add_group(group("g", &["x", "y", "z"])).unwrap();
        let mut b = Document::new(OriginId::generate());
        b.apply_update(&a.encode_state_as_update(), a.origin()).unwrap();
        let (a_deltas, _sa) = capture(&a);
        let (b_deltas, _sb) = capture(&b);

        // Each side alone still sees a valid two-member group.
        a.delete_shape("x");
        b.delete_shape("y");
        assert_eq!(a.get_group("g").unwrap().shape_ids, vec!["y", "z"]);
        assert_eq!(b.get_group("g").unwrap().shape_ids, vec!["x", "z"]);
        let undo_depth = a.stack_sizes().undo;

        let from_a = a_deltas.lock().unwrap().clone();
        let from_b = b_deltas.lock().unwrap().clone();
        for delta in &from_b {
            a.apply_update(delta, b.origin()).unwrap();
        }
        for delta in &from_a {
            b.apply_update(delta, a.origin()).unwrap();
        }

        assert!(a.get_group("g").is_none());
        assert!(b.get_group("g").is_none());
        assert_eq!(a.get_shape("z").unwrap().group_id, None);
        assert_eq!(b.get_shape("z").unwrap().group_id, None);

        // The follow-up cleanups are ordinary deltas; exchanging them settles
        // both replicas on the same state.
        let a_cleanup: Vec<Vec<u8>> = a_deltas.lock().unwrap()[from_a.len()..].to_vec();
        let b_cleanup: Vec<Vec<u8>> = b_deltas.lock().unwrap()[from_b.len()..].to_vec();
        assert!(!a_cleanup.is_empty());
        for delta in &b_cleanup {
            a.apply_update(delta, b.origin()).unwrap();
        }
        for delta in &a_cleanup {
            b.apply_update(delta, a.origin()).unwrap();
        }
        assert_eq!(ids(&a.get_all_shapes()), vec!["z"]);
        assert_eq!(a.get_all_shapes(), b.get_all_shapes());
        assert_eq!(a.get_all_groups(), b.get_all_groups());
        assert!(a.get_all_groups().is_empty());

        // The cleanup is not an undoable local edit.
        assert_eq!(a.stack_sizes().undo, undo_depth);
    }

    #[test]
    fn test_redelivered_delta_fires_no_update_event() {
        let mut source = Document::new(OriginId::generate());
        let (deltas, _sub) = capture(&source);
        source.add_shape(rect("s1", 0.0, 0.0)).unwrap();
        source.add_shape(rect("s2", 0.0, 0.0)).unwrap();
        source.delete_shape("s1");
        let deltas = deltas.lock().unwrap().clone();

        let mut replica = Document::new(OriginId::generate());
        let merged = Arc::new(AtomicUsize::new(0));
        let counter = merged.clone();
        let _events = replica.on_update(move |event| {
            if !event.local {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // The delete arrives before what it deletes: parked, still reported.
        replica.apply_update(&deltas[2], source.origin()).unwrap();
        assert_eq!(merged.load(Ordering::SeqCst), 1);

        for delta in &deltas[..2] {
            replica.apply_update(delta, source.origin()).unwrap();
        }
        assert_eq!(merged.load(Ordering::SeqCst), 3);
        assert_eq!(ids(&replica.get_all_shapes()), vec!["s2"]);

        // Everything again, as a reconnect handshake would resend it.
        for delta in &deltas {
            replica.apply_update(delta, source.origin()).unwrap();
        }
        replica
            .apply_update(&source.encode_state_as_update(), source.origin())
            .unwrap();
        assert_eq!(merged.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_update_group_relinks_members() {
        let mut doc = Document::new(OriginId::generate());
        for id in ["a", "b", "c"] {
            doc.add_shape(rect(id, 0.0, 0.0)).unwrap();
        }
        doc.add_group(group("g1", &["a", "b"])).unwrap();

        let patch = GroupPatch {
            shape_ids: Some(vec!["b".into(), "c".into()]),
            locked: Some(true),
            ..GroupPatch::default()
        };
        assert!(doc.update_group("g1", patch).unwrap());

        assert_eq!(doc.get_shape("a").unwrap().group_id, None);
        assert_eq!(doc.get_shape("c").unwrap().group_id.as_deref(), Some("g1"));
        assert!(doc.get_group("g1").unwrap().locked);
    }

    #[test]
    fn test_unsubscribed_observer_not_called() {
        let mut doc = Document::new(OriginId::generate());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = doc.on_shapes_change(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        doc.add_shape(rect("a", 0.0, 0.0)).unwrap();
        sub.unsubscribe();
        doc.add_shape(rect("b", 0.0, 0.0)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_operation_coalesce() {
        let mut op = Operation::UpdateShape {
            id: "a".into(),
            patch: ShapePatch::position(1.0, 1.0),
        };
        assert!(op
            .coalesce(Operation::UpdateShape {
                id: "a".into(),
                patch: ShapePatch::position(2.0, 2.0),
            })
            .is_ok());
        assert_eq!(
            op,
            Operation::UpdateShape {
                id: "a".into(),
                patch: ShapePatch::position(2.0, 2.0),
            }
        );

        let other = Operation::DeleteShape("a".into());
        assert_eq!(op.coalesce(other.clone()), Err(other));
    }
}
