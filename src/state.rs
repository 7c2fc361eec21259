//! State engine (C8).
//!
//! Pure functions over field-valued object state, plus `BuildState` which
//! replays a tree's decoded changes (see [`crate::tree::ObjectTree::iterate_root`])
//! into an [`ObjectState`] projection. Ties between concurrent writers are
//! broken deterministically by `(timestamp, change_id)` ascending (spec §5).

use std::collections::BTreeMap;

use p2panda_core::Hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::CoreError;
use crate::tree::DecodedChange;

pub const SNAPSHOT_INTERVAL: u32 = 10;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("object has no changes to build state from")]
    NoChanges,
    #[error("malformed change body: {0}")]
    Malformed(String),
}

impl From<StateError> for CoreError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NoChanges => CoreError::not_found(e.to_string()),
            StateError::Malformed(_) => CoreError::invalid_input(e.to_string()),
        }
    }
}

/// A single field mutation carried inside a non-root change body (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeOp {
    Set { field: String, value: Value },
    Unset { field: String },
}

/// `{ops: [ChangeOp...]}` — the body of a non-root change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectChange {
    pub ops: Vec<ChangeOp>,
}

impl ObjectChange {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// `InitChange(fields) → ObjectChange` of all `set` ops (spec §4.5).
pub fn init_change(fields: &BTreeMap<String, Value>) -> ObjectChange {
    ObjectChange {
        ops: fields
            .iter()
            .map(|(field, value)| ChangeOp::Set { field: field.clone(), value: value.clone() })
            .collect(),
    }
}

/// `DiffState(current_state, new_fields) → ObjectChange | none` — `set` for
/// new/modified keys, `unset` for removed keys. Returns `None` when the diff
/// is empty.
pub fn diff_state(current: &BTreeMap<String, Value>, new_fields: &BTreeMap<String, Value>) -> Option<ObjectChange> {
    let mut ops = Vec::new();

    for (field, new_value) in new_fields {
        match current.get(field) {
            Some(old_value) if old_value == new_value => {}
            _ => ops.push(ChangeOp::Set { field: field.clone(), value: new_value.clone() }),
        }
    }
    for field in current.keys() {
        if !new_fields.contains_key(field) {
            ops.push(ChangeOp::Unset { field: field.clone() });
        }
    }

    if ops.is_empty() {
        None
    } else {
        Some(ObjectChange { ops })
    }
}

/// `SnapshotChange(state) → ObjectChange` — complete `set` of all current
/// fields, used when version crosses [`SNAPSHOT_INTERVAL`].
pub fn snapshot_change(fields: &BTreeMap<String, Value>) -> ObjectChange {
    init_change(fields)
}

/// Computed projection of a tree (spec §3 "ObjectState").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectState {
    pub object_id: String,
    pub object_type: String,
    pub fields: BTreeMap<String, Value>,
    pub version: u32,
    pub head_id: String,
    pub timestamp: u64,
    pub owner_key: String,
}

/// Sort key used to break ties between concurrent writers deterministically:
/// `(timestamp, change_id)` ascending (spec §5).
fn ordering_key(change: &DecodedChange) -> (u64, String) {
    (change.timestamp, change.hash.to_hex())
}

/// `BuildState(tree, object_id, object_type)` (spec §4.5): starting with
/// empty fields, replay ops; on each snapshot, clear fields then apply; track
/// `version`, `head_id`, `timestamp`. Fails with `no_changes` if version
/// stays at 0.
///
/// `changes` must already be decrypted (see [`crate::tree::ObjectTree::iterate_root`]);
/// the root's own `change_payload` is not a [`ObjectChange`] and is skipped.
pub fn build_state(
    mut changes: Vec<DecodedChange>,
    object_id: String,
    object_type: String,
) -> Result<ObjectState, StateError> {
    changes.sort_by(|a, b| ordering_key(a).cmp(&ordering_key(b)));

    let mut fields: BTreeMap<String, Value> = BTreeMap::new();
    let mut version: u32 = 0;
    let mut head_id = String::new();
    let mut timestamp: u64 = 0;
    let mut owner_key = String::new();

    for change in &changes {
        let parsed: ObjectChange = match serde_json::from_slice(&change.plaintext) {
            Ok(c) => c,
            Err(e) => return Err(StateError::Malformed(e.to_string())),
        };

        if change.is_snapshot {
            fields.clear();
        }
        for op in parsed.ops {
            match op {
                ChangeOp::Set { field, value } => {
                    fields.insert(field, value);
                }
                ChangeOp::Unset { field } => {
                    fields.remove(&field);
                }
            }
        }

        version += 1;
        head_id = change.hash.to_hex();
        timestamp = change.timestamp;
        owner_key = change.author.to_hex();
    }

    if version == 0 {
        return Err(StateError::NoChanges);
    }

    Ok(ObjectState {
        object_id,
        object_type,
        fields,
        version,
        head_id,
        timestamp,
        owner_key,
    })
}

/// Decides whether the next write to an object should be a full snapshot
/// (spec §4.7: object manager "appends either a diff change or a snapshot
/// when `version % 10 == 0`").
pub fn should_snapshot(next_version: u32) -> bool {
    next_version % SNAPSHOT_INTERVAL == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn init_change_emits_all_sets() {
        let f = fields(&[("title", json!("hello")), ("count", json!(3))]);
        let change = init_change(&f);
        assert_eq!(change.ops.len(), 2);
        assert!(change.ops.iter().all(|op| matches!(op, ChangeOp::Set { .. })));
    }

    #[test]
    fn diff_state_detects_set_and_unset() {
        let current = fields(&[("a", json!(1)), ("b", json!(2))]);
        let new = fields(&[("a", json!(1)), ("c", json!(3))]);
        let diff = diff_state(&current, &new).unwrap();

        let has_unset_b = diff.ops.iter().any(|op| matches!(op, ChangeOp::Unset { field } if field == "b"));
        let has_set_c = diff.ops.iter().any(|op| matches!(op, ChangeOp::Set { field, value } if field == "c" && *value == json!(3)));
        assert!(has_unset_b);
        assert!(has_set_c);
        // "a" is unchanged, must not appear.
        assert!(!diff.ops.iter().any(|op| matches!(op, ChangeOp::Set { field, .. } if field == "a")));
    }

    #[test]
    fn diff_state_returns_none_when_empty() {
        let current = fields(&[("a", json!(1))]);
        assert!(diff_state(&current, &current.clone()).is_none());
    }

    #[test]
    fn should_snapshot_every_tenth_version() {
        assert!(should_snapshot(10));
        assert!(should_snapshot(20));
        assert!(!should_snapshot(11));
    }

    fn decoded(ops: ObjectChange, is_snapshot: bool, ts: u64) -> DecodedChange {
        DecodedChange {
            hash: Hash::new(&ts.to_be_bytes()),
            author: p2panda_core::PrivateKey::new().public_key(),
            is_snapshot,
            data_type: "matou.object.v1".into(),
            timestamp: ts,
            plaintext: serde_json::to_vec(&ops).unwrap(),
        }
    }

    #[test]
    fn build_state_replays_snapshot_then_diff() {
        let snapshot = ObjectChange {
            ops: vec![ChangeOp::Set { field: "title".into(), value: json!("first") }],
        };
        let diff = ObjectChange {
            ops: vec![ChangeOp::Set { field: "title".into(), value: json!("second") }],
        };

        let changes = vec![decoded(snapshot, true, 1), decoded(diff, false, 2)];
        let state = build_state(changes, "obj1".into(), "note".into()).unwrap();

        assert_eq!(state.version, 2);
        assert_eq!(state.fields.get("title"), Some(&json!("second")));
    }

    #[test]
    fn build_state_fails_with_no_changes() {
        let err = build_state(vec![], "obj1".into(), "note".into()).unwrap_err();
        assert!(matches!(err, StateError::NoChanges));
    }
}
