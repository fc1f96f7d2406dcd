//! Record types stored in the replicated document.
//!
//! Shapes and groups are stored as one CRDT map entry each, serialized with
//! `serde_json`. Patches carry only the fields a caller wants to change.
//! All payloads are validated before they reach the document.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Current document schema version written into [`Metadata`].
pub const SCHEMA_VERSION: u32 = 1;

/// Minimum number of members a group must reference.
pub const MIN_GROUP_SIZE: usize = 2;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shape primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rectangle,
    Circle,
    Text,
    Line,
}

/// 2D point in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Axis-aligned rectangle used for group bounds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Style {
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f64,
    pub opacity: f64,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            fill: "#ffffff".to_string(),
            stroke: "#000000".to_string(),
            stroke_width: 1.0,
            opacity: 1.0,
        }
    }
}

/// A shape record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    pub position: Point,
    pub dimensions: Size,
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Shape {
    /// Create a shape with default style and fresh timestamps.
    pub fn new(id: impl Into<String>, kind: ShapeKind, position: Point, dimensions: Size) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            kind,
            position,
            dimensions,
            style: Style::default(),
            content: None,
            group_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_id(&self.id)?;
        if !self.position.is_finite() {
            return Err(ValidationError::NonFinite("position"));
        }
        validate_size(&self.dimensions)?;
        validate_style(&self.style)
    }

    /// Apply a patch in place. `updated_at` is stamped by the document.
    pub fn apply(&mut self, patch: &ShapePatch) {
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(dimensions) = patch.dimensions {
            self.dimensions = dimensions;
        }
        if let Some(style) = &patch.style {
            self.style = style.clone();
        }
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if let Some(group_id) = &patch.group_id {
            self.group_id = group_id.clone();
        }
    }
}

/// Partial shape update. `None` leaves the field untouched; the nested
/// `Option` on nullable fields clears them with `Some(None)`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapePatch {
    pub kind: Option<ShapeKind>,
    pub position: Option<Point>,
    pub dimensions: Option<Size>,
    pub style: Option<Style>,
    pub content: Option<Option<String>>,
    pub group_id: Option<Option<String>>,
}

impl ShapePatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            position: Some(Point::new(x, y)),
            ..Self::default()
        }
    }

    pub fn dimensions(width: f64, height: f64) -> Self {
        Self {
            dimensions: Some(Size::new(width, height)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold a later patch into this one. Fields set in `later` win.
    pub fn merge(&mut self, later: ShapePatch) {
        if later.kind.is_some() {
            self.kind = later.kind;
        }
        if later.position.is_some() {
            self.position = later.position;
        }
        if later.dimensions.is_some() {
            self.dimensions = later.dimensions;
        }
        if later.style.is_some() {
            self.style = later.style;
        }
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.group_id.is_some() {
            self.group_id = later.group_id;
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(position) = &self.position {
            if !position.is_finite() {
                return Err(ValidationError::NonFinite("position"));
            }
        }
        if let Some(dimensions) = &self.dimensions {
            validate_size(dimensions)?;
        }
        if let Some(style) = &self.style {
            validate_style(style)?;
        }
        Ok(())
    }
}

/// A group record: an ordered set of shape ids moved and locked together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub shape_ids: Vec<String>,
    pub bounds: Bounds,
    pub locked: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Group {
    pub fn new(id: impl Into<String>, shape_ids: Vec<String>, bounds: Bounds) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            shape_ids,
            bounds,
            locked: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_id(&self.id)?;
        validate_members(&self.shape_ids)?;
        validate_bounds(&self.bounds)
    }

    pub fn apply(&mut self, patch: &GroupPatch) {
        if let Some(shape_ids) = &patch.shape_ids {
            self.shape_ids = shape_ids.clone();
        }
        if let Some(bounds) = patch.bounds {
            self.bounds = bounds;
        }
        if let Some(locked) = patch.locked {
            self.locked = locked;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupPatch {
    pub shape_ids: Option<Vec<String>>,
    pub bounds: Option<Bounds>,
    pub locked: Option<bool>,
}

impl GroupPatch {
    pub fn merge(&mut self, later: GroupPatch) {
        if later.shape_ids.is_some() {
            self.shape_ids = later.shape_ids;
        }
        if later.bounds.is_some() {
            self.bounds = later.bounds;
        }
        if later.locked.is_some() {
            self.locked = later.locked;
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(shape_ids) = &self.shape_ids {
            validate_members(shape_ids)?;
        }
        if let Some(bounds) = &self.bounds {
            validate_bounds(bounds)?;
        }
        Ok(())
    }
}

/// Document-wide singleton record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub version: u32,
    pub created_at: u64,
    pub last_modified: u64,
}

impl Metadata {
    pub fn new(now: u64) -> Self {
        Self {
            version: SCHEMA_VERSION,
            created_at: now,
            last_modified: now,
        }
    }

    /// Advance `last_modified`, never moving it backwards.
    pub fn touch(&mut self, now: u64) {
        self.last_modified = self.last_modified.max(now);
    }
}

/// Malformed mutation payload, reported synchronously to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyId,
    NonFinite(&'static str),
    NegativeSize,
    OpacityOutOfRange(f64),
    TooFewMembers { got: usize },
    DuplicateMember(String),
    Unencodable(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "Record id must not be empty"),
            Self::NonFinite(field) => write!(f, "Field '{field}' must be finite"),
            Self::NegativeSize => write!(f, "Dimensions must not be negative"),
            Self::OpacityOutOfRange(v) => write!(f, "Opacity {v} outside [0, 1]"),
            Self::TooFewMembers { got } => {
                write!(f, "Group needs at least {MIN_GROUP_SIZE} shapes, got {got}")
            }
            Self::DuplicateMember(id) => write!(f, "Shape {id} listed twice in group"),
            Self::Unencodable(e) => write!(f, "Record cannot be encoded: {e}"),
        }
    }
}

impl std::error::Error for ValidationError {}

fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::EmptyId);
    }
    Ok(())
}

fn validate_size(size: &Size) -> Result<(), ValidationError> {
    if !size.width.is_finite() || !size.height.is_finite() {
        return Err(ValidationError::NonFinite("dimensions"));
    }
    if size.width < 0.0 || size.height < 0.0 {
        return Err(ValidationError::NegativeSize);
    }
    Ok(())
}

fn validate_style(style: &Style) -> Result<(), ValidationError> {
    if !style.stroke_width.is_finite() {
        return Err(ValidationError::NonFinite("strokeWidth"));
    }
    if !(0.0..=1.0).contains(&style.opacity) {
        return Err(ValidationError::OpacityOutOfRange(style.opacity));
    }
    Ok(())
}

fn validate_bounds(bounds: &Bounds) -> Result<(), ValidationError> {
    let finite = [bounds.x, bounds.y, bounds.width, bounds.height]
        .iter()
        .all(|v| v.is_finite());
    if !finite {
        return Err(ValidationError::NonFinite("bounds"));
    }
    Ok(())
}

fn validate_members(shape_ids: &[String]) -> Result<(), ValidationError> {
    if shape_ids.len() < MIN_GROUP_SIZE {
        return Err(ValidationError::TooFewMembers { got: shape_ids.len() });
    }
    for (i, id) in shape_ids.iter().enumerate() {
        validate_id(id)?;
        if shape_ids[..i].contains(id) {
            return Err(ValidationError::DuplicateMember(id.clone()));
        }
    }
    Ok(())
}
