//! # atelier-core - page content model for the Atelier editor
//!
//! - [`component`]: component records, patches, id generation, dedup
//! - [`document`]: CRDT-backed [`ComponentStore`] (yrs array of records)
//! - [`snapshot`]: normalization of persisted snapshot shapes

pub mod component;
pub mod document;
pub mod snapshot;

pub use component::{
    dedup_by_id, generate_component_id, ComponentPatch, ComponentRecord, Dedup, Props,
};
pub use document::{ComponentStore, DocumentError, COMPONENTS};
pub use snapshot::normalize_snapshot;
