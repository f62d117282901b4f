//! Component records: the atomic editable unit of a page.
//!
//! A record is positioned (`x`, `y`, `width`, `height`), typed (`type` selects
//! the rendering strategy on the editor side) and carries an open `props` bag
//! whose schema depends on the component type.
//!
//! Records are replaced wholesale, never patched field-by-field inside the
//! CRDT: an update is `delete + insert` at the same index with the merged
//! record. [`ComponentPatch`] describes the merge.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Open, component-specific configuration.
pub type Props = Map<String, Value>;

/// One positioned, typed, configurable unit of page content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    /// Unique within a room. Empty means "not assigned yet".
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub component_type: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub props: Props,
}

impl ComponentRecord {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            props: Props::new(),
        }
    }

    pub fn with_geometry(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Assign a generated id if the record has none. Returns `true` if one was assigned.
    pub fn ensure_id(&mut self, author_id: &str) -> bool {
        if self.id.is_empty() {
            self.id = generate_component_id(author_id);
            true
        } else {
            false
        }
    }

    /// Encode as the JSON string stored in the replicated array.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Partial update for a [`ComponentRecord`].
///
/// Present fields overwrite, absent fields keep their value. `props` is
/// replaced as a whole bag, not merged key by key. The id is not patchable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentPatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub component_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Props>,
}

impl ComponentPatch {
    /// Patch that only moves the component.
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// Patch that only resizes the component.
    pub fn size(width: f64, height: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn with_props(mut self, props: Props) -> Self {
        self.props = Some(props);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge this patch over `base`, keeping `base.id`.
    pub fn apply_to(&self, base: &ComponentRecord) -> ComponentRecord {
        ComponentRecord {
            id: base.id.clone(),
            component_type: self
                .component_type
                .clone()
                .unwrap_or_else(|| base.component_type.clone()),
            x: self.x.unwrap_or(base.x),
            y: self.y.unwrap_or(base.y),
            width: self.width.unwrap_or(base.width),
            height: self.height.unwrap_or(base.height),
            props: self.props.clone().unwrap_or_else(|| base.props.clone()),
        }
    }

    /// Build a fresh record from this patch. Used when an upsert targets an
    /// id the local replica has never seen.
    pub fn into_record(self, id: impl Into<String>) -> ComponentRecord {
        ComponentRecord {
            id: id.into(),
            component_type: self.component_type.unwrap_or_default(),
            x: self.x.unwrap_or_default(),
            y: self.y.unwrap_or_default(),
            width: self.width.unwrap_or_default(),
            height: self.height.unwrap_or_default(),
            props: self.props.unwrap_or_default(),
        }
    }
}

/// Generate a component id: `"{unix_ms}-{9 base36 chars}-{author_id}"`.
pub fn generate_component_id(author_id: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| std::char::from_digit(rng.gen_range(0..36), 36).unwrap_or('0'))
        .collect();
    format!("{millis}-{suffix}-{author_id}")
}

/// Result of [`dedup_by_id`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dedup {
    /// Records with duplicate ids removed, original order kept.
    pub records: Vec<ComponentRecord>,
    /// Positions (in the input) of the dropped duplicates, ascending.
    pub duplicate_indices: Vec<usize>,
}

impl Dedup {
    pub fn has_duplicates(&self) -> bool {
        !self.duplicate_indices.is_empty()
    }
}

/// Keep the first occurrence of every id, drop later ones.
pub fn dedup_by_id(records: Vec<ComponentRecord>) -> Dedup {
    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
    let mut kept = Vec::with_capacity(records.len());
    let mut duplicate_indices = Vec::new();

    for (index, record) in records.into_iter().enumerate() {
        if seen.contains(&record.id) {
            duplicate_indices.push(index);
        } else {
            seen.insert(record.id.clone());
            kept.push(record);
        }
    }

    Dedup {
        records: kept,
        duplicate_indices,
    }
}
