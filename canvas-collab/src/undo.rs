//! Local undo/redo history.
//!
//! Every committed local transaction becomes exactly one stack item holding
//! the before/after value of each record it touched. The document replays
//! items in reverse, skipping any record whose most recent write came from a
//! different origin, so a remote participant's edit is never reverted.

use crate::document::OriginId;
use crate::model::{Group, Shape};
use crate::observer::{Observers, Subscription};

/// Identifies one record inside the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Shape(String),
    Group(String),
}

/// A single record transition captured inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Shape {
        id: String,
        before: Option<Shape>,
        after: Option<Shape>,
    },
    Group {
        id: String,
        before: Option<Group>,
        after: Option<Group>,
    },
}

impl Change {
    pub fn key(&self) -> EntryKey {
        match self {
            Change::Shape { id, .. } => EntryKey::Shape(id.clone()),
            Change::Group { id, .. } => EntryKey::Group(id.clone()),
        }
    }

    /// Fold a later transition of the same record into this one, keeping
    /// the earliest `before` and the latest `after`.
    pub(crate) fn absorb(&mut self, later: Change) {
        match (self, later) {
            (Change::Shape { after, .. }, Change::Shape { after: next, .. }) => *after = next,
            (Change::Group { after, .. }, Change::Group { after: next, .. }) => *after = next,
            _ => {}
        }
    }

    /// True when the transition left the record unchanged.
    pub(crate) fn is_noop(&self) -> bool {
        match self {
            Change::Shape { before, after, .. } => before == after,
            Change::Group { before, after, .. } => before == after,
        }
    }
}

/// One undo or redo step.
#[derive(Debug, Clone)]
pub struct StackItem {
    pub origin: OriginId,
    pub changes: Vec<Change>,
}

/// Stack sizes reported to `on_stack_change` subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackSizes {
    pub undo: usize,
    pub redo: usize,
}

#[derive(Debug, Clone)]
pub struct UndoConfig {
    /// Oldest items are discarded beyond this depth.
    pub max_depth: usize,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self { max_depth: 500 }
    }
}

/// Undo/redo stacks scoped to one local origin.
pub struct UndoManager {
    origin: OriginId,
    undo: Vec<StackItem>,
    redo: Vec<StackItem>,
    config: UndoConfig,
    observers: Observers<StackSizes>,
}

impl UndoManager {
    pub fn new(origin: OriginId, config: UndoConfig) -> Self {
        Self {
            origin,
            undo: Vec::new(),
            redo: Vec::new(),
            config,
            observers: Observers::new(),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Record a fresh local transaction. Clears the redo stack.
    pub fn record(&mut self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let before = self.sizes();
        self.push(StackKind::Undo, changes);
        self.redo.clear();
        self.notify_if_changed(before);
    }

    pub(crate) fn pop(&mut self, kind: StackKind) -> Option<StackItem> {
        match kind {
            StackKind::Undo => self.undo.pop(),
            StackKind::Redo => self.redo.pop(),
        }
    }

    pub(crate) fn push(&mut self, kind: StackKind, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let item = StackItem {
            origin: self.origin,
            changes,
        };
        let stack = match kind {
            StackKind::Undo => &mut self.undo,
            StackKind::Redo => &mut self.redo,
        };
        stack.push(item);
        if stack.len() > self.config.max_depth {
            let excess = stack.len() - self.config.max_depth;
            stack.drain(..excess);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn sizes(&self) -> StackSizes {
        StackSizes {
            undo: self.undo.len(),
            redo: self.redo.len(),
        }
    }

    /// Drop all history.
    pub fn clear(&mut self) {
        let before = self.sizes();
        self.undo.clear();
        self.redo.clear();
        self.notify_if_changed(before);
    }

    pub fn on_stack_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StackSizes) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub(crate) fn notify_if_changed(&self, before: StackSizes) {
        let after = self.sizes();
        if after != before {
            self.observers.notify(&after);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackKind {
    Undo,
    Redo,
}
