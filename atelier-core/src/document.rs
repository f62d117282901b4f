//! CRDT-backed component store.
//!
//! ```text
//! ┌───────────────────────────── yrs::Doc ─────────────────────────────┐
//! │  Array "components"                                                 │
//! │  [ json(ComponentRecord) | json(ComponentRecord) | …            ]   │
//! └─────────────────────────────────────────────────────────────────────┘
//!          ▲ local ops (one TransactionMut each → v1 update)
//!          │
//!          ▼ remote updates (apply_update)
//! ```
//!
//! Every local mutation runs inside exactly one transaction and returns the
//! encoded update of that transaction, which is what the transport
//! broadcasts. Convergence of concurrent inserts/deletes is left to yrs.
//!
//! Readers always see a deduplicated list (first occurrence per id wins);
//! [`ComponentStore::dedup`] additionally rewrites the array so the
//! duplicates disappear for every peer.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, Doc, Out, ReadTxn, StateVector, Transact, Update, WriteTxn};

use crate::component::{dedup_by_id, ComponentPatch, ComponentRecord};

/// Name of the root array holding the component records.
pub const COMPONENTS: &str = "components";

/// Errors raised by [`ComponentStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to encode component {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

/// Replicated, ordered list of component records for one room.
pub struct ComponentStore {
    doc: Doc,
}

impl ComponentStore {
    /// Create an empty store with a random yrs client id.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create an empty store with a fixed yrs client id (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        // Root types must exist before the first remote update lands.
        doc.get_or_insert_array(COMPONENTS);
        Self { doc }
    }

    /// Materialized, deduplicated list.
    pub fn load(&self) -> Vec<ComponentRecord> {
        let txn = self.doc.transact();
        dedup_by_id(read_raw(&txn).into_iter().map(|(_, r)| r).collect()).records
    }

    /// Raw element count, duplicates and unparseable elements included.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_array(COMPONENTS).map_or(0, |array| array.len(&txn))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a record.
    pub fn push(&self, record: &ComponentRecord) -> Result<Vec<u8>, DocumentError> {
        let json = encode(record)?;
        let mut txn = self.doc.transact_mut();
        let array = txn.get_or_insert_array(COMPONENTS);
        array.push_back(&mut txn, json);
        Ok(txn.encode_update_v1())
    }

    /// Clear and reinsert in one transaction, so no observer ever sees an
    /// empty intermediate state.
    pub fn replace_all(&self, records: &[ComponentRecord]) -> Result<Vec<u8>, DocumentError> {
        let encoded = records.iter().map(encode).collect::<Result<Vec<_>, _>>()?;

        let mut txn = self.doc.transact_mut();
        let array = txn.get_or_insert_array(COMPONENTS);
        let len = array.len(&txn);
        if len > 0 {
            array.remove_range(&mut txn, 0, len);
        }
        for (index, json) in encoded.into_iter().enumerate() {
            array.insert(&mut txn, index as u32, json);
        }
        Ok(txn.encode_update_v1())
    }

    /// Replace the record with `id` by `patch` merged over it, at the same
    /// index. Appends a new record when `id` is unknown, which heals a
    /// replica that missed the original insert.
    pub fn upsert(&self, id: &str, patch: &ComponentPatch) -> Result<Vec<u8>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        let array = txn.get_or_insert_array(COMPONENTS);
        let existing = read_raw(&txn).into_iter().find(|(_, r)| r.id == id);

        match existing {
            Some((index, current)) => {
                let json = encode(&patch.apply_to(&current))?;
                array.remove(&mut txn, index);
                array.insert(&mut txn, index, json);
            }
            None => {
                log::debug!("upsert of unknown component {id}, appending");
                let json = encode(&patch.clone().into_record(id))?;
                array.push_back(&mut txn, json);
            }
        }
        Ok(txn.encode_update_v1())
    }

    /// Delete the record with `id`. `None` when no such record exists.
    pub fn remove(&self, id: &str) -> Option<Vec<u8>> {
        let mut txn = self.doc.transact_mut();
        let array = txn.get_or_insert_array(COMPONENTS);
        let index = read_raw(&txn).into_iter().find(|(_, r)| r.id == id)?.0;
        array.remove(&mut txn, index);
        Some(txn.encode_update_v1())
    }

    /// Remove later duplicates of every id from the array itself.
    ///
    /// Returns the update when something was removed. Peers that run the
    /// pass concurrently delete the same items, which yrs merges as one.
    pub fn dedup(&self) -> Option<Vec<u8>> {
        let mut txn = self.doc.transact_mut();
        let array = txn.get_or_insert_array(COMPONENTS);
        let raw = read_raw(&txn);
        let positions: Vec<u32> = raw.iter().map(|(index, _)| *index).collect();
        let dedup = dedup_by_id(raw.into_iter().map(|(_, r)| r).collect());
        if !dedup.has_duplicates() {
            return None;
        }

        // Remove from the back so earlier indices stay valid.
        for duplicate in dedup.duplicate_indices.iter().rev() {
            array.remove(&mut txn, positions[*duplicate]);
        }
        log::debug!("removed {} duplicate component(s)", dedup.duplicate_indices.len());
        Some(txn.encode_update_v1())
    }

    /// Apply an update produced by another replica.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    /// Encoded state vector (sync step 1 payload).
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the holder of `state_vector` is missing (sync step 2 payload).
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }
}

impl Default for ComponentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(record: &ComponentRecord) -> Result<String, DocumentError> {
    record.to_json().map_err(|source| DocumentError::Encode {
        id: record.id.clone(),
        source,
    })
}

/// Parse every element, keeping its array index. Elements that are not
/// JSON component strings are skipped.
fn read_raw<T: ReadTxn>(txn: &T) -> Vec<(u32, ComponentRecord)> {
    let Some(array) = txn.get_array(COMPONENTS) else {
        return Vec::new();
    };

    array
        .iter(txn)
        .enumerate()
        .filter_map(|(index, value)| match value {
            Out::Any(Any::String(json)) => match ComponentRecord::from_json(&json) {
                Ok(record) => Some((index as u32, record)),
                Err(e) => {
                    log::warn!("skipping unparseable component at {index}: {e}");
                    None
                }
            },
            other => {
                log::warn!("skipping non-string component element at {index}: {other:?}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(id: &str) -> ComponentRecord {
        ComponentRecord::new(id, "text").with_geometry(0.0, 0.0, 100.0, 20.0)
    }

    fn ids(store: &ComponentStore) -> Vec<String> {
        store.load().into_iter().map(|r| r.id).collect()
    }

    /// Ship every update of `from` that `to` is missing.
    fn sync(from: &ComponentStore, to: &ComponentStore) {
        let diff = from.encode_diff(&to.state_vector()).unwrap();
        to.apply_update(&diff).unwrap();
    }

    #[test]
    fn test_empty_store() {
        let store = ComponentStore::new();
        assert!(store.is_empty());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_push_and_load() {
        let store = ComponentStore::new();
        let update = store.push(&text("a")).unwrap();
        store.push(&text("b")).unwrap();

        assert!(!update.is_empty());
        assert_eq!(ids(&store), vec!["a", "b"]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_upsert_replaces_at_same_index() {
        let store = ComponentStore::new();
        store.replace_all(&[text("a"), text("b"), text("c")]).unwrap();

        store.upsert("b", &ComponentPatch::position(42.0, 7.0)).unwrap();

        let records = store.load();
        assert_eq!(ids(&store), vec!["a", "b", "c"]);
        assert_eq!((records[1].x, records[1].y), (42.0, 7.0));
        assert_eq!(records[1].width, 100.0);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_upsert_unknown_appends() {
        let store = ComponentStore::new();
        store.push(&text("a")).unwrap();
        store.upsert("ghost", &ComponentPatch::size(5.0, 5.0)).unwrap();

        assert_eq!(ids(&store), vec!["a", "ghost"]);
        assert_eq!(store.load()[1].width, 5.0);
    }

    #[test]
    fn test_remove_present_and_missing() {
        let store = ComponentStore::new();
        store.replace_all(&[text("a"), text("b")]).unwrap();

        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        assert_eq!(ids(&store), vec!["b"]);
    }

    #[test]
    fn test_replace_all_is_single_update() {
        let source = ComponentStore::new();
        source.replace_all(&[text("old")]).unwrap();
        let replica = ComponentStore::new();
        sync(&source, &replica);

        let update = source.replace_all(&[text("x"), text("y")]).unwrap();
        // one update carries both the clear and the reinsert
        replica.apply_update(&update).unwrap();
        assert_eq!(ids(&replica), vec!["x", "y"]);
    }

    #[test]
    fn test_local_updates_replicate() {
        let a = ComponentStore::with_client_id(1);
        let b = ComponentStore::with_client_id(2);

        let u1 = a.push(&text("one")).unwrap();
        let u2 = a.upsert("one", &ComponentPatch::position(9.0, 9.0)).unwrap();
        b.apply_update(&u1).unwrap();
        b.apply_update(&u2).unwrap();

        assert_eq!(a.load(), b.load());
    }

    #[test]
    fn test_dedup_on_read_and_rewrite() {
        let a = ComponentStore::with_client_id(1);
        let b = ComponentStore::with_client_id(2);

        // Both peers insert the same id concurrently.
        a.push(&text("dup").with_prop("from", "a")).unwrap();
        b.push(&text("dup").with_prop("from", "b")).unwrap();
        sync(&a, &b);
        sync(&b, &a);

        assert_eq!(a.len(), 2);
        assert_eq!(a.load().len(), 1);
        assert_eq!(a.load(), b.load());

        let first_seen = a.load()[0].clone();
        let rewrite = a.dedup().expect("duplicates present");
        assert_eq!(a.len(), 1);
        assert_eq!(a.load()[0], first_seen);

        // Second pass is a no-op.
        assert!(a.dedup().is_none());

        b.apply_update(&rewrite).unwrap();
        assert_eq!(b.len(), 1);
        assert!(b.dedup().is_none());
    }

    #[test]
    fn test_concurrent_dedup_converges() {
        let a = ComponentStore::with_client_id(1);
        let b = ComponentStore::with_client_id(2);
        a.push(&text("x")).unwrap();
        b.push(&text("x")).unwrap();
        sync(&a, &b);
        sync(&b, &a);

        let ua = a.dedup().unwrap();
        let ub = b.dedup().unwrap();
        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a.load(), b.load());
    }

    fn sorted(store: &ComponentStore) -> Vec<ComponentRecord> {
        let mut records = store.load();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    #[test]
    fn test_concurrent_edits_converge_in_any_delivery_order() {
        let base = ComponentStore::with_client_id(9);
        base.replace_all(&[text("a"), text("b"), text("c"), text("d")]).unwrap();

        let replicas: Vec<ComponentStore> = (1..=3).map(ComponentStore::with_client_id).collect();
        for replica in &replicas {
            sync(&base, replica);
        }

        // Overlapping ids, no exchange in between.
        let edits = vec![
            vec![
                replicas[0].upsert("b", &ComponentPatch::position(5.0, 5.0)).unwrap(),
                replicas[0].remove("c").unwrap(),
                replicas[0].push(&text("e")).unwrap(),
            ],
            vec![replicas[1].replace_all(&[text("a"), text("c"), text("f")]).unwrap()],
            vec![
                replicas[2].remove("b").unwrap(),
                replicas[2].upsert("d", &ComponentPatch::size(1.0, 1.0)).unwrap(),
                replicas[2].upsert("c", &ComponentPatch::position(3.0, 3.0)).unwrap(),
            ],
        ];

        // Forward order: each replica takes the others' updates by origin.
        for (target, replica) in replicas.iter().enumerate() {
            for (origin, updates) in edits.iter().enumerate() {
                if origin != target {
                    for update in updates {
                        replica.apply_update(update).unwrap();
                    }
                }
            }
        }

        // Two late joiners get everything, newest first and interleaved.
        let reversed = ComponentStore::with_client_id(4);
        let interleaved = ComponentStore::with_client_id(5);
        sync(&base, &reversed);
        sync(&base, &interleaved);
        for update in edits.iter().rev().flat_map(|u| u.iter().rev()) {
            reversed.apply_update(update).unwrap();
        }
        let order = [(2, 0), (0, 0), (1, 0), (2, 1), (0, 1), (2, 2), (0, 2)];
        for (origin, index) in order {
            interleaved.apply_update(&edits[origin][index]).unwrap();
        }

        let expected = sorted(&replicas[0]);
        let expected_ids: Vec<&str> = expected.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(expected_ids, vec!["a", "b", "c", "d", "e", "f"]);
        for store in replicas.iter().chain([&reversed, &interleaved]) {
            assert_eq!(sorted(store), expected);
        }
    }

    #[test]
    fn test_handshake_diff() {
        let server = ComponentStore::new();
        server.replace_all(&[text("a"), text("b")]).unwrap();

        let client = ComponentStore::new();
        let diff = server.encode_diff(&client.state_vector()).unwrap();
        client.apply_update(&diff).unwrap();
        assert_eq!(ids(&client), vec!["a", "b"]);

        let full = ComponentStore::new();
        full.apply_update(&server.encode_state()).unwrap();
        assert_eq!(full.load(), server.load());
    }

    #[test]
    fn test_malformed_inputs() {
        let store = ComponentStore::new();
        assert!(matches!(
            store.apply_update(&[0xFF, 0xFE, 0xFD]),
            Err(DocumentError::MalformedUpdate(_))
        ));
        assert!(matches!(
            store.encode_diff(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(DocumentError::MalformedStateVector(_))
        ));
    }
}
