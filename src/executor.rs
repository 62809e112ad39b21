//! Executes decoded mutation batches against chain state.
//!
//! The executor is a pure function over an [`EntityView`]: it validates the
//! whole batch up front, then walks the operation lists in execution order
//! (creates, deletes, updates, extends, change-owners) producing canonical
//! operations and the event logs the processor records in the receipt.
//! Any failure aborts the entire batch with no partial effects and no
//! partial logs.

use ahash::{AHashMap, AHashSet};
use alloy_primitives::{keccak256, Address, Bytes, Log, B256, U256};

use crate::{
    entity::EntityRecord,
    events::ArkivEvent,
    wire::{ArkivTransaction, WireNumericAnnotation, WireStringAnnotation},
    Annotation, BlockNumber, EntityKey, NumericAnnotation, StringAnnotation, TxIndex,
    VersionCoords, MAX_CONTENT_TYPE_BYTES,
};

/// Failure reading chain state while executing a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("state view: {0}")]
pub struct ViewError(pub String);

/// Read access to the entity state a batch executes against. The store-side
/// mirror and in-memory harnesses both implement this; the executor itself
/// never talks to storage directly.
pub trait EntityView {
    /// The latest version of `key`, tombstones included. `None` when the
    /// key has never existed.
    fn latest(&self, key: &EntityKey) -> Result<Option<EntityRecord>, ViewError>;

    /// Keys whose latest live version expires exactly at `block`.
    fn expiring_at(&self, block: BlockNumber) -> Result<Vec<EntityKey>, ViewError>;
}

/// Chain position and sender of the transaction a batch arrived in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Block the transaction is part of.
    pub block_number: BlockNumber,
    /// Hash of the transaction; feeds entity key derivation.
    pub tx_hash: B256,
    /// Index of the transaction within its block.
    pub tx_index: TxIndex,
    /// Transaction sender; becomes owner and creator on create and is the
    /// subject of ownership checks elsewhere.
    pub sender: Address,
}

/// Which operation list an error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// The create list.
    Create,
    /// The delete list.
    Delete,
    /// The update list.
    Update,
    /// The extend list.
    Extend,
    /// The change-owner list.
    ChangeOwner,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OpKind::Create => "create",
            OpKind::Delete => "delete",
            OpKind::Update => "update",
            OpKind::Extend => "extend",
            OpKind::ChangeOwner => "change-owner",
        })
    }
}

/// Errors failing a whole batch. Validation variants carry the list and
/// position of the first offending operation; runtime variants carry the
/// entity key and sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// A create or update declared a zero lifetime.
    #[error("{kind} operation {index}: BTL is 0")]
    ZeroBtl {
        /// Offending list.
        kind: OpKind,
        /// Position within the list.
        index: usize,
    },
    /// A create or update declared an empty content type.
    #[error("{kind} operation {index}: content type is empty")]
    EmptyContentType {
        /// Offending list.
        kind: OpKind,
        /// Position within the list.
        index: usize,
    },
    /// A create or update declared a content type over 128 bytes.
    #[error("{kind} operation {index}: content type exceeds {MAX_CONTENT_TYPE_BYTES} bytes")]
    OversizedContentType {
        /// Offending list.
        kind: OpKind,
        /// Position within the list.
        index: usize,
    },
    /// An annotation key does not match the identifier pattern.
    #[error("{kind} operation {index}: invalid annotation key {key:?}")]
    InvalidAnnotationKey {
        /// Offending list.
        kind: OpKind,
        /// Position within the list.
        index: usize,
        /// The rejected name.
        key: String,
    },
    /// An annotation key starts with the reserved `$` prefix.
    #[error("{kind} operation {index}: annotation key {key:?} is reserved")]
    ReservedAnnotationKey {
        /// Offending list.
        kind: OpKind,
        /// Position within the list.
        index: usize,
        /// The rejected name.
        key: String,
    },
    /// The same annotation key appears twice within one type family of a
    /// single operation.
    #[error("{kind} operation {index}: duplicate {family} annotation key {key:?}")]
    DuplicateAnnotationKey {
        /// Offending list.
        kind: OpKind,
        /// Position within the list.
        index: usize,
        /// `"string"` or `"numeric"`.
        family: &'static str,
        /// The duplicated name.
        key: String,
    },
    /// An extend declared zero additional blocks.
    #[error("extend operation {index}: number of blocks is 0")]
    ZeroExtension {
        /// Position within the extend list.
        index: usize,
    },
    /// A freshly derived key collides with a live entity.
    #[error("entity {key} already exists")]
    EntityExists {
        /// The colliding key.
        key: EntityKey,
    },
    /// The operation targets an unknown or already-deleted entity.
    #[error("entity {key} not found")]
    MissingEntity {
        /// The missing key.
        key: EntityKey,
    },
    /// The sender does not own the targeted entity.
    #[error("sender {sender} is not the owner of entity {key}")]
    NotOwner {
        /// The targeted entity.
        key: EntityKey,
        /// The rejected sender.
        sender: Address,
    },
    /// Chain state could not be read.
    #[error(transparent)]
    View(#[from] ViewError),
}

/// A fully resolved create: everything the mirror needs, no chain access
/// required to replay it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalCreate {
    /// Derived entity key.
    pub key: EntityKey,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Content type.
    pub content_type: String,
    /// Owner (and creator) of the new entity.
    pub owner: Address,
    /// Absolute expiration block.
    pub expires_at: BlockNumber,
    /// Where in the block this operation sits.
    pub coords: VersionCoords,
    /// User string annotations.
    pub string_annotations: Vec<StringAnnotation>,
    /// User numeric annotations.
    pub numeric_annotations: Vec<NumericAnnotation>,
}

/// A fully resolved update. Owner and creator are preserved; the mirror
/// copies the creator and creation block from the prior version row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalUpdate {
    /// Target entity.
    pub key: EntityKey,
    /// Replacement payload.
    pub payload: Bytes,
    /// Replacement content type.
    pub content_type: String,
    /// Owner at the time of the update.
    pub owner: Address,
    /// New absolute expiration block.
    pub expires_at: BlockNumber,
    /// Where in the block this operation sits.
    pub coords: VersionCoords,
    /// Replacement string annotations.
    pub string_annotations: Vec<StringAnnotation>,
    /// Replacement numeric annotations.
    pub numeric_annotations: Vec<NumericAnnotation>,
}

/// A fully resolved delete; `expired` distinguishes housekeeping reaps
/// from user-initiated deletes (they are indistinguishable in the store).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalDelete {
    /// Target entity.
    pub key: EntityKey,
    /// Where in the block this operation sits.
    pub coords: VersionCoords,
    /// Whether this delete was system-originated expiration.
    pub expired: bool,
}

/// A fully resolved lifetime extension. Annotations of the prior version
/// are re-stamped onto the new version coordinates by the mirror.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalExtend {
    /// Target entity.
    pub key: EntityKey,
    /// New absolute expiration block.
    pub expires_at: BlockNumber,
    /// Where in the block this operation sits.
    pub coords: VersionCoords,
}

/// A fully resolved ownership transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalChangeOwner {
    /// Target entity.
    pub key: EntityKey,
    /// Owner after the transfer.
    pub new_owner: Address,
    /// Where in the block this operation sits.
    pub coords: VersionCoords,
}

/// One canonical operation of a block write-ahead record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CanonicalOp {
    /// Create a new entity version chain.
    Create(CanonicalCreate),
    /// Replace an entity's content.
    Update(CanonicalUpdate),
    /// Tombstone an entity.
    Delete(CanonicalDelete),
    /// Extend an entity's lifetime.
    Extend(CanonicalExtend),
    /// Transfer ownership.
    ChangeOwner(CanonicalChangeOwner),
}

impl CanonicalOp {
    /// The entity this operation touches.
    pub fn key(&self) -> EntityKey {
        match self {
            CanonicalOp::Create(op) => op.key,
            CanonicalOp::Update(op) => op.key,
            CanonicalOp::Delete(op) => op.key,
            CanonicalOp::Extend(op) => op.key,
            CanonicalOp::ChangeOwner(op) => op.key,
        }
    }

    /// Where in the block this operation sits.
    pub fn coords(&self) -> VersionCoords {
        match self {
            CanonicalOp::Create(op) => op.coords,
            CanonicalOp::Update(op) => op.coords,
            CanonicalOp::Delete(op) => op.coords,
            CanonicalOp::Extend(op) => op.coords,
            CanonicalOp::ChangeOwner(op) => op.coords,
        }
    }
}

/// The atomic output of one batch: canonical operations in execution
/// order plus the event logs the receipt records, in the same order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutedBatch {
    /// Canonical operations.
    pub ops: Vec<CanonicalOp>,
    /// Receipt logs, one per operation.
    pub logs: Vec<Log>,
}

/// Derive the key of the `op_index`-th create of a transaction:
/// `keccak256(tx_hash ∥ payload ∥ left_pad_32(op_index))`. Reproducible
/// from on-chain data alone.
pub(crate) fn derive_entity_key(tx_hash: B256, payload: &[u8], op_index: u64) -> EntityKey {
    let mut preimage = Vec::with_capacity(32 + payload.len() + 32);
    preimage.extend_from_slice(tx_hash.as_slice());
    preimage.extend_from_slice(payload);
    preimage.extend_from_slice(B256::from(U256::from(op_index)).as_slice());
    keccak256(&preimage)
}

// Uncommitted effects of the batch executed so far, layered over the view
// so later operations observe earlier ones (delete-after-create in one
// batch must see the fresh entity).
struct Overlay<'a, V> {
    view: &'a V,
    pending: AHashMap<EntityKey, EntityRecord>,
}

impl<'a, V: EntityView> Overlay<'a, V> {
    fn new(view: &'a V) -> Self {
        Self {
            view,
            pending: AHashMap::new(),
        }
    }

    fn latest(&self, key: &EntityKey) -> Result<Option<EntityRecord>, ExecutorError> {
        if let Some(record) = self.pending.get(key) {
            return Ok(Some(record.clone()));
        }
        Ok(self.view.latest(key)?)
    }

    // The latest live version, or the batch-level error for this target.
    fn live(&self, key: &EntityKey) -> Result<EntityRecord, ExecutorError> {
        match self.latest(key)? {
            Some(record) if !record.deleted => Ok(record),
            _ => Err(ExecutorError::MissingEntity { key: *key }),
        }
    }

    fn put(&mut self, record: EntityRecord) {
        self.pending.insert(record.key, record);
    }
}

fn validate_content_op(
    kind: OpKind,
    index: usize,
    btl: u64,
    content_type: &str,
    strings: &[WireStringAnnotation],
    numerics: &[WireNumericAnnotation],
) -> Result<(), ExecutorError> {
    if btl == 0 {
        return Err(ExecutorError::ZeroBtl { kind, index });
    }
    if content_type.is_empty() {
        return Err(ExecutorError::EmptyContentType { kind, index });
    }
    if content_type.len() > MAX_CONTENT_TYPE_BYTES {
        return Err(ExecutorError::OversizedContentType { kind, index });
    }
    validate_annotation_keys(kind, index, "string", strings.iter().map(|a| a.key.as_str()))?;
    validate_annotation_keys(
        kind,
        index,
        "numeric",
        numerics.iter().map(|a| a.key.as_str()),
    )
}

fn validate_annotation_keys<'k>(
    kind: OpKind,
    index: usize,
    family: &'static str,
    keys: impl Iterator<Item = &'k str>,
) -> Result<(), ExecutorError> {
    let mut seen = AHashSet::new();
    for key in keys {
        if key.starts_with('$') {
            return Err(ExecutorError::ReservedAnnotationKey {
                kind,
                index,
                key: key.to_owned(),
            });
        }
        if !crate::is_valid_annotation_key(key) {
            return Err(ExecutorError::InvalidAnnotationKey {
                kind,
                index,
                key: key.to_owned(),
            });
        }
        if !seen.insert(key) {
            return Err(ExecutorError::DuplicateAnnotationKey {
                kind,
                index,
                family,
                key: key.to_owned(),
            });
        }
    }
    Ok(())
}

// Pre-execution validation, all-or-nothing: the first offending operation
// fails the batch before any effect is computed.
fn validate_batch(batch: &ArkivTransaction) -> Result<(), ExecutorError> {
    for (index, op) in batch.creates.iter().enumerate() {
        validate_content_op(
            OpKind::Create,
            index,
            op.btl,
            &op.content_type,
            &op.string_annotations,
            &op.numeric_annotations,
        )?;
    }
    for (index, op) in batch.updates.iter().enumerate() {
        validate_content_op(
            OpKind::Update,
            index,
            op.btl,
            &op.content_type,
            &op.string_annotations,
            &op.numeric_annotations,
        )?;
    }
    for (index, op) in batch.extends.iter().enumerate() {
        if op.number_of_blocks == 0 {
            return Err(ExecutorError::ZeroExtension { index });
        }
    }
    Ok(())
}

fn user_strings(annotations: &[WireStringAnnotation]) -> Vec<StringAnnotation> {
    annotations
        .iter()
        .map(|a| Annotation::new(a.key.clone(), a.value.clone()))
        .collect()
}

fn user_numerics(annotations: &[WireNumericAnnotation]) -> Vec<NumericAnnotation> {
    annotations
        .iter()
        .map(|a| Annotation::new(a.key.clone(), a.value))
        .collect()
}

/// Execute one decoded batch against `view`. Returns the canonical
/// operations and receipt logs, or the error that fails the whole
/// transaction. Operation indices are assigned by execution order across
/// all five lists, so every version row this block produces has distinct
/// coordinates.
pub fn execute_batch<V: EntityView>(
    view: &V,
    ctx: &ExecutionContext,
    batch: &ArkivTransaction,
) -> Result<ExecutedBatch, ExecutorError> {
    validate_batch(batch)?;

    let mut overlay = Overlay::new(view);
    let mut out = ExecutedBatch::default();
    let mut op_counter: u64 = 0;
    let mut next_coords = |counter: &mut u64| {
        let coords = VersionCoords::new(ctx.block_number, ctx.tx_index, *counter);
        *counter += 1;
        coords
    };

    for (index, op) in batch.creates.iter().enumerate() {
        let key = derive_entity_key(ctx.tx_hash, &op.payload, index as u64);
        if matches!(overlay.latest(&key)?, Some(prev) if !prev.deleted) {
            return Err(ExecutorError::EntityExists { key });
        }
        let coords = next_coords(&mut op_counter);
        let expires_at = ctx.block_number.saturating_add(op.btl);
        let record = EntityRecord {
            key,
            payload: op.payload.clone(),
            content_type: op.content_type.clone(),
            owner: ctx.sender,
            creator: ctx.sender,
            expires_at,
            created_at: ctx.block_number,
            coords,
            deleted: false,
            string_annotations: user_strings(&op.string_annotations),
            numeric_annotations: user_numerics(&op.numeric_annotations),
        };
        out.ops.push(CanonicalOp::Create(CanonicalCreate {
            key,
            payload: record.payload.clone(),
            content_type: record.content_type.clone(),
            owner: ctx.sender,
            expires_at,
            coords,
            string_annotations: record.string_annotations.clone(),
            numeric_annotations: record.numeric_annotations.clone(),
        }));
        out.logs.push(
            ArkivEvent::Created {
                key,
                owner: ctx.sender,
                expires_at,
            }
            .to_log(),
        );
        overlay.put(record);
    }

    for key in &batch.deletes {
        let previous = overlay.live(key)?;
        if previous.owner != ctx.sender {
            return Err(ExecutorError::NotOwner {
                key: *key,
                sender: ctx.sender,
            });
        }
        let coords = next_coords(&mut op_counter);
        out.ops.push(CanonicalOp::Delete(CanonicalDelete {
            key: *key,
            coords,
            expired: false,
        }));
        out.logs.push(
            ArkivEvent::Deleted {
                key: *key,
                owner: previous.owner,
            }
            .to_log(),
        );
        overlay.put(EntityRecord {
            coords,
            deleted: true,
            string_annotations: Vec::new(),
            numeric_annotations: Vec::new(),
            ..previous
        });
    }

    for op in &batch.updates {
        let previous = overlay.live(&op.entity_key)?;
        if previous.owner != ctx.sender {
            return Err(ExecutorError::NotOwner {
                key: op.entity_key,
                sender: ctx.sender,
            });
        }
        let coords = next_coords(&mut op_counter);
        let expires_at = ctx.block_number.saturating_add(op.btl);
        let record = EntityRecord {
            payload: op.payload.clone(),
            content_type: op.content_type.clone(),
            expires_at,
            coords,
            string_annotations: user_strings(&op.string_annotations),
            numeric_annotations: user_numerics(&op.numeric_annotations),
            ..previous
        };
        out.ops.push(CanonicalOp::Update(CanonicalUpdate {
            key: op.entity_key,
            payload: record.payload.clone(),
            content_type: record.content_type.clone(),
            owner: record.owner,
            expires_at,
            coords,
            string_annotations: record.string_annotations.clone(),
            numeric_annotations: record.numeric_annotations.clone(),
        }));
        out.logs.push(
            ArkivEvent::Updated {
                key: op.entity_key,
                owner: record.owner,
                old_expires_at: previous.expires_at,
                new_expires_at: expires_at,
            }
            .to_log(),
        );
        overlay.put(record);
    }

    for op in &batch.extends {
        // Extension is deliberately permissive: any sender may pay to keep
        // an entity alive, so there is no ownership check here.
        let previous = overlay.live(&op.entity_key)?;
        let coords = next_coords(&mut op_counter);
        let expires_at = previous.expires_at.saturating_add(op.number_of_blocks);
        out.ops.push(CanonicalOp::Extend(CanonicalExtend {
            key: op.entity_key,
            expires_at,
            coords,
        }));
        out.logs.push(
            ArkivEvent::Extended {
                key: op.entity_key,
                owner: previous.owner,
                old_expires_at: previous.expires_at,
                new_expires_at: expires_at,
            }
            .to_log(),
        );
        overlay.put(EntityRecord {
            expires_at,
            coords,
            ..previous
        });
    }

    for op in &batch.change_owners {
        let previous = overlay.live(&op.entity_key)?;
        if previous.owner != ctx.sender {
            return Err(ExecutorError::NotOwner {
                key: op.entity_key,
                sender: ctx.sender,
            });
        }
        let coords = next_coords(&mut op_counter);
        out.ops.push(CanonicalOp::ChangeOwner(CanonicalChangeOwner {
            key: op.entity_key,
            new_owner: op.new_owner,
            coords,
        }));
        out.logs.push(
            ArkivEvent::OwnerChanged {
                key: op.entity_key,
                old_owner: previous.owner,
                new_owner: op.new_owner,
            }
            .to_log(),
        );
        overlay.put(EntityRecord {
            owner: op.new_owner,
            coords,
            ..previous
        });
    }

    Ok(out)
}

/// Build the system-driven housekeeping batch for `block`: a tombstone for
/// every entity whose latest live version expires exactly there. These
/// emit `ArkivEntityExpired` logs and are otherwise indistinguishable from
/// user deletes in the store. `tx_index` is the position of the synthetic
/// system transaction carrying the batch.
pub fn expiration_batch<V: EntityView>(
    view: &V,
    block: BlockNumber,
    tx_index: TxIndex,
) -> Result<ExecutedBatch, ExecutorError> {
    let mut keys = view.expiring_at(block)?;
    keys.sort_unstable();

    let mut out = ExecutedBatch::default();
    for (index, key) in keys.iter().enumerate() {
        let Some(previous) = view.latest(key)? else {
            continue;
        };
        if previous.deleted || previous.expires_at != block {
            continue;
        }
        out.ops.push(CanonicalOp::Delete(CanonicalDelete {
            key: *key,
            coords: VersionCoords::new(block, tx_index, index as u64),
            expired: true,
        }));
        out.logs.push(
            ArkivEvent::Expired {
                key: *key,
                owner: previous.owner,
            }
            .to_log(),
        );
    }
    Ok(out)
}

/// In-memory chain state: the latest version of every entity ever touched.
/// This is the executor-facing state of a simulated chain; harnesses and
/// the resync path use it as the authoritative entity set.
#[derive(Clone, Debug, Default)]
pub struct MemoryView {
    entities: AHashMap<EntityKey, EntityRecord>,
}

impl MemoryView {
    /// An empty chain state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing execution.
    pub fn insert(&mut self, record: EntityRecord) {
        self.entities.insert(record.key, record);
    }

    /// Fold a batch's canonical operations into the state.
    pub fn apply_ops(&mut self, ops: &[CanonicalOp]) {
        for op in ops {
            match op {
                CanonicalOp::Create(create) => {
                    self.entities.insert(create.key, EntityRecord {
                        key: create.key,
                        payload: create.payload.clone(),
                        content_type: create.content_type.clone(),
                        owner: create.owner,
                        creator: create.owner,
                        expires_at: create.expires_at,
                        created_at: create.coords.block_number,
                        coords: create.coords,
                        deleted: false,
                        string_annotations: create.string_annotations.clone(),
                        numeric_annotations: create.numeric_annotations.clone(),
                    });
                }
                CanonicalOp::Update(update) => {
                    if let Some(previous) = self.entities.get_mut(&update.key) {
                        previous.payload = update.payload.clone();
                        previous.content_type = update.content_type.clone();
                        previous.expires_at = update.expires_at;
                        previous.coords = update.coords;
                        previous.string_annotations = update.string_annotations.clone();
                        previous.numeric_annotations = update.numeric_annotations.clone();
                    }
                }
                CanonicalOp::Delete(delete) => {
                    if let Some(previous) = self.entities.get_mut(&delete.key) {
                        previous.deleted = true;
                        previous.coords = delete.coords;
                        previous.string_annotations = Vec::new();
                        previous.numeric_annotations = Vec::new();
                    }
                }
                CanonicalOp::Extend(extend) => {
                    if let Some(previous) = self.entities.get_mut(&extend.key) {
                        previous.expires_at = extend.expires_at;
                        previous.coords = extend.coords;
                    }
                }
                CanonicalOp::ChangeOwner(change) => {
                    if let Some(previous) = self.entities.get_mut(&change.key) {
                        previous.owner = change.new_owner;
                        previous.coords = change.coords;
                    }
                }
            }
        }
    }

    /// All live (non-tombstoned) records, in unspecified order.
    pub fn live_records(&self) -> Vec<EntityRecord> {
        self.entities
            .values()
            .filter(|record| !record.deleted)
            .cloned()
            .collect()
    }
}

impl EntityView for MemoryView {
    fn latest(&self, key: &EntityKey) -> Result<Option<EntityRecord>, ViewError> {
        Ok(self.entities.get(key).cloned())
    }

    fn expiring_at(&self, block: BlockNumber) -> Result<Vec<EntityKey>, ViewError> {
        Ok(self
            .entities
            .values()
            .filter(|record| !record.deleted && record.expires_at == block)
            .map(|record| record.key)
            .collect())
    }
}
