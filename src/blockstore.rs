//! Remote block store (C4).
//!
//! CID-addressed block get/put/exists over the relay file role (spec §4.10,
//! §6 wire RPCs `BlockPush`, `BlockGet{wait}`, `BlocksCheck`, `BlocksBind`,
//! `FilesDelete`). The `{space_id, file_id}` scalar the chunker needs is held
//! in a small mutex (spec §5: "Block-store context ... guarded by a small
//! mutex; callers set before, reset after"), never propagated implicitly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::CoreError;

#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("block not found: {0}")]
    NotFound(String),
    #[error("cancelled")]
    Cancelled,
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<BlockStoreError> for CoreError {
    fn from(e: BlockStoreError) -> Self {
        match e {
            BlockStoreError::NetworkUnavailable(_) => CoreError::NetworkUnavailable(e.to_string()),
            BlockStoreError::NotFound(_) => CoreError::not_found(e.to_string()),
            BlockStoreError::Cancelled => CoreError::Cancelled,
            BlockStoreError::Malformed(_) => CoreError::Internal(e.to_string()),
        }
    }
}

/// The block store's per-operation context. Set before a batch of chunker
/// calls, reset after — not threaded through every call argument (spec §5;
/// spec §4.10 point 2: "the DAG chunker uses an internal context, so relying
/// on propagated context values is forbidden").
#[derive(Debug, Clone, Default)]
pub struct BlockContext {
    pub space_id: String,
    pub file_id: String,
}

#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    async fn set_context(&self, ctx: BlockContext);

    /// `BlockPush(space_id, file_id, cid, data)`.
    async fn put(&self, cid: &str, data: Vec<u8>) -> Result<(), BlockStoreError>;

    /// `BlockGet{wait}` — when `wait` is true, blocks until the relay has the
    /// block or `cancel` resolves.
    async fn get(&self, cid: &str, wait: bool, cancel: &tokio::sync::Notify) -> Result<Vec<u8>, BlockStoreError>;

    /// `BlocksCheck` — subset of `cids` present on the relay.
    async fn exists_cids(&self, cids: &[String]) -> Result<Vec<String>, BlockStoreError>;

    /// `BlocksBind(space_id, file_id, roots)`.
    async fn bind(&self, roots: &[String]) -> Result<(), BlockStoreError>;

    /// `FilesDelete` — no-op at the client; the relay owns deletion (spec
    /// §4.10).
    async fn delete(&self, _cid: &str) -> Result<(), BlockStoreError> {
        Ok(())
    }
}

pub struct HttpBlockStore {
    client: reqwest::Client,
    base_url: String,
    context: Mutex<BlockContext>,
}

impl HttpBlockStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client with a fixed timeout always builds");
        HttpBlockStore {
            client,
            base_url: base_url.into(),
            context: Mutex::new(BlockContext::default()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait::async_trait]
impl BlockStore for HttpBlockStore {
    async fn set_context(&self, ctx: BlockContext) {
        *self.context.lock().await = ctx;
    }

    async fn put(&self, cid: &str, data: Vec<u8>) -> Result<(), BlockStoreError> {
        let ctx = self.context.lock().await.clone();
        #[derive(Serialize)]
        struct Req {
            space_id: String,
            file_id: String,
            cid: String,
            #[serde(with = "base64_bytes")]
            data: Vec<u8>,
        }

        let response = self
            .client
            .post(self.url("/file/block_push"))
            .json(&Req { space_id: ctx.space_id, file_id: ctx.file_id, cid: cid.to_string(), data })
            .send()
            .await
            .map_err(|e| BlockStoreError::NetworkUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BlockStoreError::NetworkUnavailable(response.status().to_string()));
        }
        Ok(())
    }

    async fn get(&self, cid: &str, wait: bool, cancel: &tokio::sync::Notify) -> Result<Vec<u8>, BlockStoreError> {
        let ctx = self.context.lock().await.clone();
        #[derive(Serialize)]
        struct Req {
            space_id: String,
            cid: String,
            wait: bool,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(with = "base64_bytes")]
            data: Vec<u8>,
        }

        let request = self
            .client
            .post(self.url("/file/block_get"))
            .json(&Req { space_id: ctx.space_id, cid: cid.to_string(), wait });

        let response = tokio::select! {
            result = request.send() => result.map_err(|e| BlockStoreError::NetworkUnavailable(e.to_string()))?,
            _ = cancel.notified() => return Err(BlockStoreError::Cancelled),
        };

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlockStoreError::NotFound(cid.to_string()));
        }
        if !response.status().is_success() {
            return Err(BlockStoreError::NetworkUnavailable(response.status().to_string()));
        }
        let body: Resp = response.json().await.map_err(|e| BlockStoreError::Malformed(e.to_string()))?;
        Ok(body.data)
    }

    async fn exists_cids(&self, cids: &[String]) -> Result<Vec<String>, BlockStoreError> {
        let ctx = self.context.lock().await.clone();
        #[derive(Serialize)]
        struct Req {
            space_id: String,
            cids: Vec<String>,
        }
        #[derive(Deserialize)]
        struct Resp {
            present: Vec<String>,
        }

        let response = self
            .client
            .post(self.url("/file/blocks_check"))
            .json(&Req { space_id: ctx.space_id, cids: cids.to_vec() })
            .send()
            .await
            .map_err(|e| BlockStoreError::NetworkUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BlockStoreError::NetworkUnavailable(response.status().to_string()));
        }
        let body: Resp = response.json().await.map_err(|e| BlockStoreError::Malformed(e.to_string()))?;
        Ok(body.present)
    }

    async fn bind(&self, roots: &[String]) -> Result<(), BlockStoreError> {
        let ctx = self.context.lock().await.clone();
        #[derive(Serialize)]
        struct Req {
            space_id: String,
            file_id: String,
            roots: Vec<String>,
        }

        let response = self
            .client
            .post(self.url("/file/blocks_bind"))
            .json(&Req { space_id: ctx.space_id, file_id: ctx.file_id, roots: roots.to_vec() })
            .send()
            .await
            .map_err(|e| BlockStoreError::NetworkUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BlockStoreError::NetworkUnavailable(response.status().to_string()));
        }
        Ok(())
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// In-memory stand-in used by tests and the file pipeline's own unit tests.
#[derive(Default)]
pub struct InMemoryBlockStore {
    context: Mutex<BlockContext>,
    blocks: Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

#[async_trait::async_trait]
impl BlockStore for InMemoryBlockStore {
    async fn set_context(&self, ctx: BlockContext) {
        *self.context.lock().await = ctx;
    }

    async fn put(&self, cid: &str, data: Vec<u8>) -> Result<(), BlockStoreError> {
        self.blocks.lock().await.insert(cid.to_string(), data);
        Ok(())
    }

    async fn get(&self, cid: &str, _wait: bool, _cancel: &tokio::sync::Notify) -> Result<Vec<u8>, BlockStoreError> {
        self.blocks
            .lock()
            .await
            .get(cid)
            .cloned()
            .ok_or_else(|| BlockStoreError::NotFound(cid.to_string()))
    }

    async fn exists_cids(&self, cids: &[String]) -> Result<Vec<String>, BlockStoreError> {
        let blocks = self.blocks.lock().await;
        Ok(cids.iter().filter(|c| blocks.contains_key(*c)).cloned().collect())
    }

    async fn bind(&self, _roots: &[String]) -> Result<(), BlockStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_put_then_get_roundtrips() {
        let store = InMemoryBlockStore::default();
        store.set_context(BlockContext { space_id: "space1".into(), file_id: "file1".into() }).await;
        store.put("cid1", b"hello".to_vec()).await.unwrap();

        let cancel = tokio::sync::Notify::new();
        let data = store.get("cid1", false, &cancel).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn missing_block_is_not_found() {
        let store = InMemoryBlockStore::default();
        let cancel = tokio::sync::Notify::new();
        let err = store.get("nope", false, &cancel).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn exists_cids_returns_present_subset() {
        let store = InMemoryBlockStore::default();
        store.put("a", b"1".to_vec()).await.unwrap();
        let present = store.exists_cids(&["a".into(), "b".into()]).await.unwrap();
        assert_eq!(present, vec!["a".to_string()]);
    }
}
