//! Typed facades (C10): narrow, domain-shaped APIs layered over the unified
//! tree manager (C9) and the state engine (C8). Each manager only knows its
//! own object-id naming convention and field shape; all tree mechanics stay
//! in `utm.rs`/`tree.rs`/`state.rs` (spec §4.7).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use p2panda_core::PrivateKey;
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::CoreError;
use crate::state::{self, ObjectState, StateError};
use crate::tree::{change_types, AddContentParams, TreeError, WritePermissionCheck};
use crate::utm::{Utm, UtmError};

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error(transparent)]
    Utm(#[from] UtmError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("illegal notice state transition: {from} -> {to}")]
    IllegalNoticeTransition { from: String, to: String },
}

impl From<FacadeError> for CoreError {
    fn from(e: FacadeError) -> Self {
        match e {
            FacadeError::Utm(e) => e.into(),
            FacadeError::Tree(e) => e.into(),
            FacadeError::State(e) => e.into(),
            FacadeError::IllegalNoticeTransition { .. } => CoreError::invalid_input(e.to_string()),
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_micros() as u64
}

fn fields_from(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> BTreeMap<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Shared plumbing: create a brand-new object tree and append its init
/// change in one step (every facade's "first write" follows this shape).
async fn create_with_init(
    utm: &Utm,
    space_id: &str,
    object_id: &str,
    object_type: &str,
    change_type: &str,
    fields: &BTreeMap<String, Value>,
    signing_key: &PrivateKey,
    permission_check: &dyn WritePermissionCheck,
) -> Result<ObjectState, FacadeError> {
    let tree = utm.create_object_tree(space_id, object_id, object_type, change_type, signing_key).await?;
    let heads = tree.heads().await?;
    let change = state::init_change(fields);
    tree.add_content(
        AddContentParams {
            data: serde_json::to_vec(&change).expect("ObjectChange always serializes"),
            signing_key: signing_key.clone(),
            is_snapshot: true,
            should_be_encrypted: true,
            timestamp: None,
            data_type: change_type.to_string(),
        },
        heads,
        permission_check,
    )
    .await?;

    let changes = tree.iterate_root().await?;
    Ok(state::build_state(changes, object_id.to_string(), object_type.to_string())?)
}

/// Shared plumbing: read current state, diff against `new_fields`, append
/// either a diff or a snapshot change (spec §4.7 object manager rule:
/// snapshot when `version % 10 == 0`).
async fn diff_and_append(
    utm: &Utm,
    space_id: &str,
    object_id: &str,
    new_fields: BTreeMap<String, Value>,
    change_type: &str,
    signing_key: &PrivateKey,
    permission_check: &dyn WritePermissionCheck,
) -> Result<ObjectState, FacadeError> {
    let tree = utm.get_tree_for_object(space_id, object_id).await?;
    let changes = tree.iterate_root().await?;
    let current = state::build_state(changes, object_id.to_string(), String::new())?;

    let Some(diff) = state::diff_state(&current.fields, &new_fields) else {
        return Ok(current);
    };

    let next_version = current.version + 1;
    let (change, is_snapshot) = if state::should_snapshot(next_version) {
        (state::snapshot_change(&new_fields), true)
    } else {
        (diff, false)
    };

    let heads = tree.heads().await?;
    tree.add_content(
        AddContentParams {
            data: serde_json::to_vec(&change).expect("ObjectChange always serializes"),
            signing_key: signing_key.clone(),
            is_snapshot,
            should_be_encrypted: true,
            timestamp: None,
            data_type: change_type.to_string(),
        },
        heads,
        permission_check,
    )
    .await?;

    let changes = tree.iterate_root().await?;
    Ok(state::build_state(changes, current.object_id, current.object_type)?)
}

async fn read_state(utm: &Utm, space_id: &str, object_id: &str) -> Result<Option<ObjectState>, FacadeError> {
    match utm.get_tree_for_object(space_id, object_id).await {
        Ok(tree) => {
            let changes = tree.iterate_root().await?;
            match state::build_state(changes, object_id.to_string(), String::new()) {
                Ok(s) => Ok(Some(s)),
                Err(StateError::NoChanges) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
        Err(UtmError::ObjectNotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ─── Credential manager (immutable objects) ──────────────────────────────────

pub struct CredentialManager<'a> {
    utm: &'a Utm,
}

impl<'a> CredentialManager<'a> {
    pub fn new(utm: &'a Utm) -> Self {
        CredentialManager { utm }
    }

    fn object_id(said: &str) -> String {
        format!("Credential-{said}")
    }

    /// Creates a tree with a single snapshot init change. Credentials are
    /// immutable — there is no update path.
    pub async fn add_credential(
        &self,
        space_id: &str,
        said: &str,
        issuer: &str,
        recipient: &str,
        schema: &str,
        data: Value,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        let fields = fields_from([
            ("said", json!(said)),
            ("issuer", json!(issuer)),
            ("recipient", json!(recipient)),
            ("schema", json!(schema)),
            ("data", data),
        ]);
        create_with_init(
            self.utm,
            space_id,
            &Self::object_id(said),
            "credential",
            change_types::CREDENTIAL,
            &fields,
            signing_key,
            permission_check,
        )
        .await
    }

    pub async fn read_credentials(&self, space_id: &str) -> Result<Vec<ObjectState>, FacadeError> {
        let mut out = Vec::new();
        for (tree_id, _) in self.utm.get_trees_by_change_type(space_id, change_types::CREDENTIAL).await {
            let tree = self.utm.get_tree(space_id, &tree_id).await?;
            let changes = tree.iterate_root().await?;
            if let Ok(state) = state::build_state(changes, tree_id, "credential".to_string()) {
                out.push(state);
            }
        }
        Ok(out)
    }

    pub async fn read_credential(&self, space_id: &str, said: &str) -> Result<Option<ObjectState>, FacadeError> {
        read_state(self.utm, space_id, &Self::object_id(said)).await
    }
}

// ─── Object manager (mutable objects with diff/snapshot logic) ──────────────

pub struct ObjectManager<'a> {
    utm: &'a Utm,
}

impl<'a> ObjectManager<'a> {
    pub fn new(utm: &'a Utm) -> Self {
        ObjectManager { utm }
    }

    pub async fn create_object(
        &self,
        space_id: &str,
        object_id: &str,
        object_type: &str,
        fields: BTreeMap<String, Value>,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        create_with_init(self.utm, space_id, object_id, object_type, change_types::OBJECT, &fields, signing_key, permission_check).await
    }

    pub async fn update_object(
        &self,
        space_id: &str,
        object_id: &str,
        new_fields: BTreeMap<String, Value>,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        diff_and_append(self.utm, space_id, object_id, new_fields, change_types::OBJECT, signing_key, permission_check).await
    }

    pub async fn read_object(&self, space_id: &str, object_id: &str) -> Result<Option<ObjectState>, FacadeError> {
        read_state(self.utm, space_id, object_id).await
    }
}

// ─── Notice manager ───────────────────────────────────────────────────────────

const NOTICE_STATES: &[&str] = &["draft", "published", "archived"];

fn notice_transition_allowed(from: &str, to: &str) -> bool {
    match (from, to) {
        ("draft", "published") => true,
        ("published", "archived") => true,
        _ => false,
    }
}

pub struct NoticeManager<'a> {
    utm: &'a Utm,
}

impl<'a> NoticeManager<'a> {
    pub fn new(utm: &'a Utm) -> Self {
        NoticeManager { utm }
    }

    pub async fn create_notice(
        &self,
        space_id: &str,
        notice_id: &str,
        mut fields: BTreeMap<String, Value>,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        fields.entry("state".to_string()).or_insert_with(|| json!("draft"));
        create_with_init(self.utm, space_id, notice_id, "notice", change_types::NOTICE, &fields, signing_key, permission_check).await
    }

    /// Enforces `draft -> published -> archived` (spec §4.7 / §8 S6). An
    /// illegal transition is rejected rather than silently ignored — see
    /// DESIGN.md for the Open Question decision.
    pub async fn update_notice_state(
        &self,
        space_id: &str,
        notice_id: &str,
        new_state: &str,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        if !NOTICE_STATES.contains(&new_state) {
            return Err(FacadeError::IllegalNoticeTransition { from: "?".into(), to: new_state.into() });
        }

        let current = read_state(self.utm, space_id, notice_id)
            .await?
            .ok_or_else(|| FacadeError::Utm(UtmError::ObjectNotFound(notice_id.to_string())))?;
        let current_state = current.fields.get("state").and_then(Value::as_str).unwrap_or("draft").to_string();

        if !notice_transition_allowed(&current_state, new_state) {
            return Err(FacadeError::IllegalNoticeTransition { from: current_state, to: new_state.to_string() });
        }

        let mut new_fields = current.fields.clone();
        new_fields.insert("state".to_string(), json!(new_state));
        match new_state {
            "published" => {
                new_fields.insert("publishedAt".to_string(), json!(now_micros()));
            }
            "archived" => {
                new_fields.insert("archivedAt".to_string(), json!(now_micros()));
            }
            _ => {}
        }

        diff_and_append(self.utm, space_id, notice_id, new_fields, change_types::NOTICE, signing_key, permission_check).await
    }

    fn rsvp_id(notice_id: &str, user_id: &str) -> String {
        format!("RSVP-{notice_id}-{user_id}")
    }

    /// Last-write-wins: every call fully replaces the RSVP object's fields.
    pub async fn rsvp(
        &self,
        space_id: &str,
        notice_id: &str,
        user_id: &str,
        status: &str,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        let object_id = Self::rsvp_id(notice_id, user_id);
        let fields = fields_from([("notice_id", json!(notice_id)), ("user_id", json!(user_id)), ("status", json!(status))]);
        self.upsert(space_id, &object_id, "rsvp", fields, signing_key, permission_check).await
    }

    fn ack_id(notice_id: &str, user_id: &str) -> String {
        format!("Ack-{notice_id}-{user_id}")
    }

    /// Idempotent: a second `ack` for the same notice/user is a no-op (spec
    /// §8 invariant 5).
    pub async fn ack(
        &self,
        space_id: &str,
        notice_id: &str,
        user_id: &str,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        let object_id = Self::ack_id(notice_id, user_id);
        if let Some(existing) = read_state(self.utm, space_id, &object_id).await? {
            return Ok(existing);
        }
        let fields = fields_from([("notice_id", json!(notice_id)), ("user_id", json!(user_id)), ("ackedAt", json!(now_micros()))]);
        create_with_init(self.utm, space_id, &object_id, "ack", change_types::INTERACTION, &fields, signing_key, permission_check).await
    }

    fn save_id(notice_id: &str, user_id: &str) -> String {
        format!("Save-{notice_id}-{user_id}")
    }

    /// Toggle: flips `saved` on each call, creating the object on first use.
    pub async fn save(
        &self,
        space_id: &str,
        notice_id: &str,
        user_id: &str,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        let object_id = Self::save_id(notice_id, user_id);
        match read_state(self.utm, space_id, &object_id).await? {
            Some(current) => {
                let saved = current.fields.get("saved").and_then(Value::as_bool).unwrap_or(false);
                let mut new_fields = current.fields.clone();
                new_fields.insert("saved".to_string(), json!(!saved));
                diff_and_append(self.utm, space_id, &object_id, new_fields, change_types::INTERACTION, signing_key, permission_check).await
            }
            None => {
                let fields = fields_from([("notice_id", json!(notice_id)), ("user_id", json!(user_id)), ("saved", json!(true))]);
                create_with_init(self.utm, space_id, &object_id, "save", change_types::INTERACTION, &fields, signing_key, permission_check).await
            }
        }
    }

    async fn upsert(
        &self,
        space_id: &str,
        object_id: &str,
        object_type: &str,
        fields: BTreeMap<String, Value>,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        match read_state(self.utm, space_id, object_id).await? {
            Some(_) => diff_and_append(self.utm, space_id, object_id, fields, change_types::INTERACTION, signing_key, permission_check).await,
            None => create_with_init(self.utm, space_id, object_id, object_type, change_types::INTERACTION, &fields, signing_key, permission_check).await,
        }
    }
}

// ─── Chat manager ─────────────────────────────────────────────────────────────

pub struct ChatManager<'a> {
    utm: &'a Utm,
}

impl<'a> ChatManager<'a> {
    pub fn new(utm: &'a Utm) -> Self {
        ChatManager { utm }
    }

    pub async fn create_channel(
        &self,
        space_id: &str,
        channel_id: &str,
        name: &str,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        let fields = fields_from([("name", json!(name))]);
        create_with_init(self.utm, space_id, channel_id, "chat_channel", change_types::CHAT, &fields, signing_key, permission_check).await
    }

    pub async fn create_message(
        &self,
        space_id: &str,
        message_id: &str,
        channel_id: &str,
        author: &str,
        body: &str,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        let fields = fields_from([("channel_id", json!(channel_id)), ("author", json!(author)), ("body", json!(body))]);
        create_with_init(self.utm, space_id, message_id, "chat_message", change_types::CHAT, &fields, signing_key, permission_check).await
    }

    pub async fn create_reaction(
        &self,
        space_id: &str,
        reaction_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        let fields = fields_from([("message_id", json!(message_id)), ("user_id", json!(user_id)), ("emoji", json!(emoji))]);
        create_with_init(self.utm, space_id, reaction_id, "chat_reaction", change_types::CHAT, &fields, signing_key, permission_check).await
    }

    /// Deletion is a state op `{set deletedAt}`, not a tree removal (spec
    /// §3: "Trees are never modified in place; deletion is a tombstone").
    pub async fn delete(
        &self,
        space_id: &str,
        object_id: &str,
        signing_key: &PrivateKey,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<ObjectState, FacadeError> {
        let current = read_state(self.utm, space_id, object_id)
            .await?
            .ok_or_else(|| FacadeError::Utm(UtmError::ObjectNotFound(object_id.to_string())))?;
        let mut new_fields = current.fields.clone();
        new_fields.insert("deletedAt".to_string(), json!(now_micros()));
        diff_and_append(self.utm, space_id, object_id, new_fields, change_types::CHAT, signing_key, permission_check).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CreateSpacePayload, StorageProvider};
    use crate::tree::AllowAll;
    use crate::utm::SpaceResolver;
    use std::sync::Arc;

    async fn fresh_utm() -> (Utm, String, PrivateKey) {
        let base = std::env::temp_dir().join(format!("matou-facades-{}", uuid::Uuid::new_v4()));
        let storage = Arc::new(StorageProvider::new(&base));
        let resolver = Arc::new(SpaceResolver::new(storage));
        let signing_key = PrivateKey::new();
        resolver
            .create_space(CreateSpacePayload { space_id: "space1".into(), signing_key: signing_key.clone() })
            .await
            .unwrap();
        (Utm::new(resolver), "space1".to_string(), signing_key)
    }

    #[tokio::test]
    async fn credential_roundtrip() {
        let (utm, space_id, signing_key) = fresh_utm().await;
        let manager = CredentialManager::new(&utm);

        manager
            .add_credential(
                &space_id,
                "ESAID_001",
                "EIssuer",
                "ERecipient",
                "ESchema",
                json!({"role": "member"}),
                &signing_key,
                &AllowAll,
            )
            .await
            .unwrap();

        let all = manager.read_credentials(&space_id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].fields.get("said"), Some(&json!("ESAID_001")));

        let one = manager.read_credential(&space_id, "ESAID_001").await.unwrap().unwrap();
        assert_eq!(one.fields.get("issuer"), Some(&json!("EIssuer")));
    }

    #[tokio::test]
    async fn object_update_diffs_then_snapshots_at_version_ten() {
        let (utm, space_id, signing_key) = fresh_utm().await;
        let manager = ObjectManager::new(&utm);

        manager
            .create_object(&space_id, "obj1", "note", fields_from([("title", json!("v1"))]), &signing_key, &AllowAll)
            .await
            .unwrap();

        let mut state = None;
        for i in 2..=10 {
            state = Some(
                manager
                    .update_object(&space_id, "obj1", fields_from([("title", json!(format!("v{i}")))]), &signing_key, &AllowAll)
                    .await
                    .unwrap(),
            );
        }
        let state = state.unwrap();
        assert_eq!(state.version, 10);
        assert_eq!(state.fields.get("title"), Some(&json!("v10")));
    }

    #[tokio::test]
    async fn notice_transitions_enforce_order() {
        let (utm, space_id, signing_key) = fresh_utm().await;
        let manager = NoticeManager::new(&utm);

        manager.create_notice(&space_id, "notice1", BTreeMap::new(), &signing_key, &AllowAll).await.unwrap();

        let published = manager.update_notice_state(&space_id, "notice1", "published", &signing_key, &AllowAll).await.unwrap();
        assert!(published.fields.contains_key("publishedAt"));

        let err = manager.update_notice_state(&space_id, "notice1", "draft", &signing_key, &AllowAll).await.unwrap_err();
        assert!(matches!(err, FacadeError::IllegalNoticeTransition { .. }));

        let archived = manager.update_notice_state(&space_id, "notice1", "archived", &signing_key, &AllowAll).await.unwrap();
        assert!(archived.fields.contains_key("archivedAt"));
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let (utm, space_id, signing_key) = fresh_utm().await;
        let manager = NoticeManager::new(&utm);
        manager.create_notice(&space_id, "notice1", BTreeMap::new(), &signing_key, &AllowAll).await.unwrap();

        let first = manager.ack(&space_id, "notice1", "user1", &signing_key, &AllowAll).await.unwrap();
        let second = manager.ack(&space_id, "notice1", "user1", &signing_key, &AllowAll).await.unwrap();
        assert_eq!(first.head_id, second.head_id);
    }

    #[tokio::test]
    async fn save_toggles() {
        let (utm, space_id, signing_key) = fresh_utm().await;
        let manager = NoticeManager::new(&utm);
        manager.create_notice(&space_id, "notice1", BTreeMap::new(), &signing_key, &AllowAll).await.unwrap();

        let first = manager.save(&space_id, "notice1", "user1", &signing_key, &AllowAll).await.unwrap();
        assert_eq!(first.fields.get("saved"), Some(&json!(true)));
        let second = manager.save(&space_id, "notice1", "user1", &signing_key, &AllowAll).await.unwrap();
        assert_eq!(second.fields.get("saved"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn chat_delete_sets_deleted_at() {
        let (utm, space_id, signing_key) = fresh_utm().await;
        let manager = ChatManager::new(&utm);
        manager.create_message(&space_id, "msg1", "chan1", "user1", "hi", &signing_key, &AllowAll).await.unwrap();

        let deleted = manager.delete(&space_id, "msg1", &signing_key, &AllowAll).await.unwrap();
        assert!(deleted.fields.contains_key("deletedAt"));
    }
}
