//! # Content store
//!
//! The single write path into durable content storage. Every `put` runs
//! the type-appropriate validation first (an invalid item is rejected
//! before it can be stored or gossiped), then lands in the backing
//! [`ContentDatabase`] under the hex of its content-id.
//!
//! ## Radius and eviction
//!
//! A node stores content `c` iff `distance(self, c) <= radius`. When the
//! database outgrows its configured capacity, the radius halves and every
//! id now outside it is deleted in one batch, repeating until the store
//! fits. The shrunken radius is what later PONGs advertise, so the
//! network stops sending content the node can no longer keep.
//!
//! ## Dependencies between types
//!
//! Bodies and receipts validate against the *stored* header for their
//! block hash; offering a body before its header is a refusal, not an
//! error in the peer's favor.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::U256;
use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::content::{ContentId, ContentKey};
use crate::identity::{xor_distance, NodeId};
use crate::protocols::{BeaconVerifier, ContentDatabase, DbOp};
use crate::validation::{
    validate_body, validate_receipts, ContentError, HeaderValidator, HeaderWithProof,
};

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database size that triggers radius shrink and eviction.
    pub capacity_bytes: u64,
    /// Radius advertised before any eviction has happened.
    pub initial_radius: U256,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { capacity_bytes: 1024 * 1024 * 1024, initial_radius: U256::MAX }
    }
}

/// What a `put` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Validated and written.
    Stored,
    /// Identical key already present; the store is unchanged.
    AlreadyStored,
    /// Content-id outside our radius; not an error, just not ours.
    OutsideRadius,
}

/// Outcome plus any ids evicted by the capacity check.
#[derive(Debug)]
pub struct PutReport {
    pub outcome: PutOutcome,
    pub evicted: Vec<ContentId>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("database error: {0}")]
    Db(anyhow::Error),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Db(err)
    }
}

pub struct ContentStore {
    db: Arc<dyn ContentDatabase>,
    self_id: NodeId,
    radius: U256,
    capacity: u64,
    validator: HeaderValidator,
    beacon: Arc<dyn BeaconVerifier>,
    /// Sizes by content-id, rebuilt from the database at open; used to
    /// evict by distance without a database scan.
    index: HashMap<ContentId, u64>,
}

impl ContentStore {
    /// Open over an existing database, rebuilding the distance index.
    pub async fn open(
        db: Arc<dyn ContentDatabase>,
        self_id: NodeId,
        validator: HeaderValidator,
        beacon: Arc<dyn BeaconVerifier>,
        config: StoreConfig,
    ) -> Result<Self> {
        let mut index = HashMap::new();
        for key in db.keys().await? {
            // Reserved identity keys and anything else non-content is
            // skipped; content keys are exactly 32 hex-encoded bytes.
            let Ok(bytes) = hex::decode(&key) else { continue };
            let Ok(id_bytes) = <[u8; 32]>::try_from(bytes.as_slice()) else { continue };
            if let Some(value) = db.get(&key).await? {
                index.insert(ContentId::from(id_bytes), value.len() as u64);
            }
        }
        info!(entries = index.len(), "content store opened");
        Ok(Self {
            db,
            self_id,
            radius: config.initial_radius,
            capacity: config.capacity_bytes,
            validator,
            beacon,
            index,
        })
    }

    pub fn radius(&self) -> U256 {
        self.radius
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_within_radius(&self, id: &ContentId) -> bool {
        xor_distance(&self.self_id, id) <= self.radius
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.index.contains_key(&key.content_id())
    }

    pub async fn get(&self, key: &ContentKey) -> Result<Option<Vec<u8>>> {
        self.get_by_id(&key.content_id()).await
    }

    pub async fn get_by_id(&self, id: &ContentId) -> Result<Option<Vec<u8>>> {
        self.db.get(&hex::encode(id)).await
    }

    /// Validate and store one item. Idempotent: re-putting a stored key
    /// leaves the store unchanged.
    pub async fn put(&mut self, key: &ContentKey, value: Vec<u8>) -> Result<PutReport, StoreError> {
        let id = key.content_id();
        if !self.is_within_radius(&id) {
            return Ok(PutReport { outcome: PutOutcome::OutsideRadius, evicted: Vec::new() });
        }
        if self.index.contains_key(&id) {
            return Ok(PutReport { outcome: PutOutcome::AlreadyStored, evicted: Vec::new() });
        }

        self.validate(key, &value).await?;

        let size = value.len() as u64;
        self.db.put(&hex::encode(id), value).await?;
        self.index.insert(id, size);
        debug!(kind = key.kind(), id = %hex::encode(&id[..8]), size, "content stored");

        let evicted = self.enforce_capacity().await?;
        Ok(PutReport { outcome: PutOutcome::Stored, evicted })
    }

    async fn validate(&self, key: &ContentKey, value: &[u8]) -> Result<(), StoreError> {
        match key {
            ContentKey::BlockHeader { block_hash } => {
                self.validator.validate_header(*block_hash, value)?;
            }
            ContentKey::BlockBody { block_hash } => {
                let header = self.stored_header(block_hash).await?;
                validate_body(&header, value)?;
            }
            ContentKey::Receipts { block_hash } => {
                let header = self.stored_header(block_hash).await?;
                validate_receipts(&header, value)?;
            }
            ContentKey::EpochAccumulator { epoch_hash } => {
                self.validator.validate_epoch_accumulator(*epoch_hash, value)?;
            }
            ContentKey::LightClientBootstrap { .. }
            | ContentKey::LightClientUpdatesByRange { .. }
            | ContentKey::LightClientFinalityUpdate { .. }
            | ContentKey::LightClientOptimisticUpdate { .. } => {
                self.beacon.validate(&key.encode(), value).await.map_err(|err| {
                    debug!(error = %err, "beacon artifact rejected");
                    ContentError::InvalidProof("beacon verifier rejected artifact")
                })?;
            }
        }
        Ok(())
    }

    /// The validated header a body or receipts value depends on.
    async fn stored_header(
        &self,
        block_hash: &alloy_primitives::B256,
    ) -> Result<alloy_consensus::Header, StoreError> {
        let header_key = ContentKey::BlockHeader { block_hash: *block_hash };
        let value = self
            .get(&header_key)
            .await?
            .ok_or(ContentError::MissingDependency("header not stored for this block"))?;
        let hwp = HeaderWithProof::decode_ssz(&value)?;
        Ok(crate::validation::decode_header(&hwp.header_rlp)?)
    }

    /// Shrink the radius and delete out-of-range content until the store
    /// fits its capacity again.
    async fn enforce_capacity(&mut self) -> Result<Vec<ContentId>> {
        let mut evicted = Vec::new();
        while self.db.size().await? > self.capacity {
            if self.radius.is_zero() {
                warn!("store over capacity with zero radius; nothing left to evict");
                break;
            }
            self.radius >>= 1;
            let doomed: Vec<ContentId> = self
                .index
                .keys()
                .copied()
                .filter(|id| xor_distance(&self.self_id, id) > self.radius)
                .collect();
            if !doomed.is_empty() {
                let ops =
                    doomed.iter().map(|id| DbOp::Del { key: hex::encode(id) }).collect::<Vec<_>>();
                self.db.batch(ops).await?;
                for id in &doomed {
                    self.index.remove(id);
                }
                evicted.extend(doomed);
            }
        }
        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                radius = %self.radius,
                "store shrank radius and evicted content"
            );
        }
        Ok(evicted)
    }
}

// ----------------------------------------------------------------------
// In-memory database
// ----------------------------------------------------------------------

/// Hash-map [`ContentDatabase`] for tests and ephemeral embeddings.
#[derive(Debug, Default)]
pub struct MemoryDb {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl ContentDatabase for MemoryDb {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn batch(&self, ops: Vec<DbOp>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for op in ops {
            match op {
                DbOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                DbOp::Del { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.entries.lock().await.values().map(|v| v.len() as u64).sum())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}
