//! Block ingestion: from `(block, receipts)` to committed mirror state.
//!
//! For each block the ingester builds a Block Write-Ahead Record, the
//! ordered list of fully resolved (canonical) operations, by pairing the
//! decoded mutation batches with their receipt logs. The record is
//! self-sufficient: applying it never consults the chain again. Before
//! applying, the recorded processing status is checked against the block's
//! parent; any discontinuity triggers a snap-sync rebuild from chain-side
//! state. Apply errors roll the block back and retry with a fixed backoff,
//! because the only permissible failures there are transient storage ones.

use std::sync::Arc;
use std::time::Duration;

use alloy_chains::Chain;
use alloy_primitives::{Address, Bytes, Log, B256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    events::{decode_arkiv_log, ArkivEvent, EventError},
    executor::{
        CanonicalChangeOwner, CanonicalCreate, CanonicalDelete, CanonicalExtend, CanonicalOp,
        CanonicalUpdate, MemoryView, ViewError,
    },
    store::{IndexStore, ProcessingStatus, StoreError},
    wire::{decode_transaction_input, WireError},
    Annotation, BlockNumber, EntityKey, IndexerConfig, NumericAnnotation, StringAnnotation,
    TxIndex, VersionCoords, ARKIV_ADDRESS,
};

/// A block as handed over by the chain node. Only the fields the indexer
/// consumes appear here; the node itself (consensus, EVM, transport) is
/// someone else's problem.
#[derive(Clone, Debug)]
pub struct ChainBlock {
    /// Chain identity the block belongs to.
    pub chain_id: u64,
    /// Block height.
    pub number: BlockNumber,
    /// Block hash.
    pub hash: B256,
    /// Hash of the parent block.
    pub parent_hash: B256,
    /// Block timestamp, seconds.
    pub timestamp: u64,
    /// Transactions in block order.
    pub transactions: Vec<ChainTransaction>,
}

/// One transaction of a [`ChainBlock`].
#[derive(Clone, Debug)]
pub struct ChainTransaction {
    /// Transaction hash.
    pub hash: B256,
    /// Recovered sender.
    pub sender: Address,
    /// Destination; `None` for contract creation.
    pub to: Option<Address>,
    /// Raw data field.
    pub input: Bytes,
    /// Whether this is a synthetic system transaction of "deposit" kind,
    /// the carrier of housekeeping expirations.
    pub deposit: bool,
}

/// Execution receipt of one transaction.
#[derive(Clone, Debug)]
pub struct TxReceipt {
    /// Whether execution succeeded. Failed receipts contribute nothing.
    pub success: bool,
    /// Logs emitted by the transaction.
    pub logs: Vec<Log>,
}

/// The Block Write-Ahead Record: everything needed to apply (or replay)
/// one block against the mirror without re-consulting the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    /// Chain identity.
    pub chain_id: u64,
    /// Block height.
    pub number: BlockNumber,
    /// Block hash, recorded as the new processing status on commit.
    pub hash: B256,
    /// Parent hash, checked against the recorded status before apply.
    pub parent_hash: B256,
    /// Block timestamp, seconds.
    pub timestamp: u64,
    /// Canonical operations in (tx index, op index) order.
    pub ops: Vec<CanonicalOp>,
}

/// One entity of a chain-side state snapshot, consumed during snap-sync.
/// Payloads arrive compressed exactly as the chain stores them.
#[derive(Clone, Debug)]
pub struct SnapshotEntity {
    /// Entity key.
    pub key: EntityKey,
    /// Brotli-compressed payload bytes.
    pub compressed_payload: Bytes,
    /// Content type.
    pub content_type: String,
    /// Current owner.
    pub owner: Address,
    /// Creator.
    pub creator: Address,
    /// Absolute expiration block.
    pub expires_at: BlockNumber,
    /// Creation block.
    pub created_at: BlockNumber,
    /// Coordinates of the latest version.
    pub coords: VersionCoords,
    /// User string annotations.
    pub string_annotations: Vec<StringAnnotation>,
    /// User numeric annotations.
    pub numeric_annotations: Vec<NumericAnnotation>,
}

/// Chain-side entity iteration at the parent state of the block being
/// applied. Only consulted when continuity is lost; empty at genesis.
pub trait SnapshotSource {
    /// The full live entity set, with annotations.
    fn entities(&self) -> Result<Vec<SnapshotEntity>, ViewError>;
}

impl SnapshotSource for MemoryView {
    fn entities(&self) -> Result<Vec<SnapshotEntity>, ViewError> {
        Ok(self
            .live_records()
            .into_iter()
            .map(|record| SnapshotEntity {
                key: record.key,
                compressed_payload: crate::wire::brotli_compress(&record.payload).into(),
                content_type: record.content_type,
                owner: record.owner,
                creator: record.creator,
                expires_at: record.expires_at,
                created_at: record.created_at,
                coords: record.coords,
                string_annotations: record.string_annotations,
                numeric_annotations: record.numeric_annotations,
            })
            .collect())
    }
}

/// Head-of-chain timing as observed by the ingester; drives future-block
/// waits on the read path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockTiming {
    /// Latest applied block.
    pub current_block: BlockNumber,
    /// Its timestamp, seconds.
    pub current_block_time: u64,
    /// Observed cadence between the last two applied blocks.
    pub duration: Duration,
}

impl Default for BlockTiming {
    fn default() -> Self {
        Self {
            current_block: 0,
            current_block_time: 0,
            duration: Duration::from_secs(2),
        }
    }
}

/// Errors surfacing from ingestion. Everything except [`NetworkMismatch`]
/// reached from inside the apply loop is retried; canonicalisation errors
/// surface immediately because no amount of retrying fixes a malformed
/// block.
///
/// [`NetworkMismatch`]: IngestError::NetworkMismatch
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The block belongs to a different network than the one the store is
    /// bound to. A store holds exactly one network.
    #[error("store is bound to network {bound}, block belongs to network {got}")]
    NetworkMismatch {
        /// Bound chain id.
        bound: u64,
        /// Offered chain id.
        got: u64,
    },
    /// Receipt list does not line up with the block's transactions.
    #[error("block {number}: {receipts} receipts for {transactions} transactions")]
    ReceiptMismatch {
        /// Block height.
        number: BlockNumber,
        /// Receipts offered.
        receipts: usize,
        /// Transactions present.
        transactions: usize,
    },
    /// A receipt's event logs do not pair up with the decoded batch.
    #[error(
        "block {number} tx {tx_index}: {logs} {kind} logs for {ops} operations"
    )]
    LogMismatch {
        /// Block height.
        number: BlockNumber,
        /// Transaction index.
        tx_index: TxIndex,
        /// Event kind that failed to pair.
        kind: &'static str,
        /// Logs found.
        logs: usize,
        /// Operations decoded.
        ops: usize,
    },
    /// Transaction data failed to decode.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// A receipt log under a known signature is malformed.
    #[error(transparent)]
    Event(#[from] EventError),
    /// The mirror rejected the block.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Chain-side state could not be iterated during snap-sync.
    #[error("chain snapshot: {0}")]
    Snapshot(ViewError),
    /// The caller cancelled the ingest; the in-flight block was rolled
    /// back.
    #[error("ingest cancelled")]
    Cancelled,
}

// Receipt logs of one transaction, split by event kind in emission order.
#[derive(Default)]
struct EventQueues {
    created: Vec<ArkivEvent>,
    updated: Vec<ArkivEvent>,
    extended: Vec<ArkivEvent>,
    owner_changed: Vec<ArkivEvent>,
    expired: Vec<ArkivEvent>,
}

fn split_events(logs: &[Log]) -> Result<EventQueues, EventError> {
    let mut queues = EventQueues::default();
    for log in logs {
        match decode_arkiv_log(log)? {
            Some(event @ ArkivEvent::Created { .. }) => queues.created.push(event),
            Some(event @ ArkivEvent::Updated { .. }) => queues.updated.push(event),
            Some(event @ ArkivEvent::Extended { .. }) => queues.extended.push(event),
            Some(event @ ArkivEvent::OwnerChanged { .. }) => queues.owner_changed.push(event),
            Some(event @ ArkivEvent::Expired { .. }) => queues.expired.push(event),
            // User deletes are taken from the decoded batch, not the log.
            Some(ArkivEvent::Deleted { .. }) | None => {}
        }
    }
    Ok(queues)
}

fn pair<'e>(
    number: BlockNumber,
    tx_index: TxIndex,
    kind: &'static str,
    events: &'e [ArkivEvent],
    ops: usize,
) -> Result<&'e [ArkivEvent], IngestError> {
    if events.len() != ops {
        return Err(IngestError::LogMismatch {
            number,
            tx_index,
            kind,
            logs: events.len(),
            ops,
        });
    }
    Ok(events)
}

/// Build the Block Write-Ahead Record for `block`. Skips failed receipts
/// and empty-data transactions; decodes Arkiv-addressed transaction data;
/// pairs each decoded operation with its receipt log; collects
/// housekeeping expirations from deposit-kind system transactions.
pub fn canonicalise(block: &ChainBlock, receipts: &[TxReceipt]) -> Result<BlockRecord, IngestError> {
    if receipts.len() != block.transactions.len() {
        return Err(IngestError::ReceiptMismatch {
            number: block.number,
            receipts: receipts.len(),
            transactions: block.transactions.len(),
        });
    }

    let mut ops = Vec::new();
    for (tx_index, (tx, receipt)) in block.transactions.iter().zip(receipts).enumerate() {
        let tx_index = tx_index as TxIndex;
        if !receipt.success {
            debug!(block = block.number, tx_index, "skipping failed receipt");
            continue;
        }

        if tx.deposit {
            // Housekeeping: expirations ride on system deposit transactions.
            let queues = split_events(&receipt.logs)?;
            for (op_index, event) in queues.expired.iter().enumerate() {
                let ArkivEvent::Expired { key, .. } = event else {
                    continue;
                };
                ops.push(CanonicalOp::Delete(CanonicalDelete {
                    key: *key,
                    coords: VersionCoords::new(block.number, tx_index, op_index as u64),
                    expired: true,
                }));
            }
            continue;
        }

        if tx.to != Some(ARKIV_ADDRESS) || tx.input.is_empty() {
            continue;
        }

        let batch = decode_transaction_input(&tx.input)?;
        let queues = split_events(&receipt.logs)?;
        let created = pair(
            block.number,
            tx_index,
            "created",
            &queues.created,
            batch.creates.len(),
        )?;
        let updated = pair(
            block.number,
            tx_index,
            "updated",
            &queues.updated,
            batch.updates.len(),
        )?;
        let extended = pair(
            block.number,
            tx_index,
            "extended",
            &queues.extended,
            batch.extends.len(),
        )?;
        let owner_changed = pair(
            block.number,
            tx_index,
            "owner-changed",
            &queues.owner_changed,
            batch.change_owners.len(),
        )?;

        let mut op_counter: u64 = 0;
        let mut next_coords = |counter: &mut u64| {
            let coords = VersionCoords::new(block.number, tx_index, *counter);
            *counter += 1;
            coords
        };

        for (op, event) in batch.creates.iter().zip(created) {
            let ArkivEvent::Created {
                key,
                owner,
                expires_at,
            } = event
            else {
                unreachable!("created queue holds created events");
            };
            ops.push(CanonicalOp::Create(CanonicalCreate {
                key: *key,
                payload: op.payload.clone(),
                content_type: op.content_type.clone(),
                owner: *owner,
                expires_at: *expires_at,
                coords: next_coords(&mut op_counter),
                string_annotations: op
                    .string_annotations
                    .iter()
                    .map(|a| Annotation::new(a.key.clone(), a.value.clone()))
                    .collect(),
                numeric_annotations: op
                    .numeric_annotations
                    .iter()
                    .map(|a| Annotation::new(a.key.clone(), a.value))
                    .collect(),
            }));
        }
        for key in &batch.deletes {
            ops.push(CanonicalOp::Delete(CanonicalDelete {
                key: *key,
                coords: next_coords(&mut op_counter),
                expired: false,
            }));
        }
        for (op, event) in batch.updates.iter().zip(updated) {
            let ArkivEvent::Updated {
                key,
                owner,
                new_expires_at,
                ..
            } = event
            else {
                unreachable!("updated queue holds updated events");
            };
            ops.push(CanonicalOp::Update(CanonicalUpdate {
                key: *key,
                payload: op.payload.clone(),
                content_type: op.content_type.clone(),
                owner: *owner,
                expires_at: *new_expires_at,
                coords: next_coords(&mut op_counter),
                string_annotations: op
                    .string_annotations
                    .iter()
                    .map(|a| Annotation::new(a.key.clone(), a.value.clone()))
                    .collect(),
                numeric_annotations: op
                    .numeric_annotations
                    .iter()
                    .map(|a| Annotation::new(a.key.clone(), a.value))
                    .collect(),
            }));
        }
        for event in extended {
            let ArkivEvent::Extended {
                key, new_expires_at, ..
            } = event
            else {
                unreachable!("extended queue holds extended events");
            };
            ops.push(CanonicalOp::Extend(CanonicalExtend {
                key: *key,
                expires_at: *new_expires_at,
                coords: next_coords(&mut op_counter),
            }));
        }
        for event in owner_changed {
            let ArkivEvent::OwnerChanged { key, new_owner, .. } = event else {
                unreachable!("owner-changed queue holds owner-changed events");
            };
            ops.push(CanonicalOp::ChangeOwner(CanonicalChangeOwner {
                key: *key,
                new_owner: *new_owner,
                coords: next_coords(&mut op_counter),
            }));
        }
    }

    Ok(BlockRecord {
        chain_id: block.chain_id,
        number: block.number,
        hash: block.hash,
        parent_hash: block.parent_hash,
        timestamp: block.timestamp,
        ops,
    })
}

// Snap-sync is required when the store has no status and the block is not
// the genesis successor, or when number/hash continuity with the recorded
// status is broken.
fn needs_resync(status: Option<&ProcessingStatus>, record: &BlockRecord) -> bool {
    match status {
        None => record.number != 1,
        Some(status) => {
            status.block_number != record.number.saturating_sub(1)
                || status.block_hash != record.parent_hash
        }
    }
}

/// Drives block application. Exactly one ingester exists per store; it is
/// the single writer.
#[derive(Debug)]
pub struct Ingester<S> {
    store: Arc<IndexStore>,
    snapshots: S,
    network: Chain,
    retry_backoff: Duration,
    timing_tx: watch::Sender<BlockTiming>,
    last_timestamp: Option<u64>,
}

impl<S: SnapshotSource> Ingester<S> {
    /// An ingester bound to `network`, rebuilding from `snapshots` when
    /// continuity is lost.
    pub fn new(
        store: Arc<IndexStore>,
        snapshots: S,
        network: Chain,
        config: &IndexerConfig,
    ) -> Self {
        let (timing_tx, _) = watch::channel(BlockTiming::default());
        Self {
            store,
            snapshots,
            network,
            retry_backoff: config.retry_backoff,
            timing_tx,
            last_timestamp: None,
        }
    }

    /// Subscribe to head-of-chain timing updates.
    pub fn timing(&self) -> watch::Receiver<BlockTiming> {
        self.timing_tx.subscribe()
    }

    /// Ingest the next block: canonicalise, resync if continuity demands
    /// it, and apply atomically, retrying with fixed backoff until the
    /// block commits or the caller cancels.
    pub async fn ingest(
        &mut self,
        block: &ChainBlock,
        receipts: &[TxReceipt],
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        if Chain::from_id(block.chain_id) != self.network {
            return Err(IngestError::NetworkMismatch {
                bound: self.network.id(),
                got: block.chain_id,
            });
        }
        let record = canonicalise(block, receipts)?;
        debug!(
            block = record.number,
            ops = record.ops.len(),
            "canonicalised block"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            match self.try_apply(&record).await {
                Ok(()) => {
                    self.publish_timing(&record);
                    return Ok(());
                }
                Err(err @ IngestError::NetworkMismatch { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        block = record.number,
                        %err,
                        backoff_ms = self.retry_backoff.as_millis() as u64,
                        "block apply failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }
    }

    async fn try_apply(&self, record: &BlockRecord) -> Result<(), IngestError> {
        let status = self.store.processing_status().await?;
        if let Some(status) = &status {
            if status.network != record.chain_id {
                return Err(IngestError::NetworkMismatch {
                    bound: status.network,
                    got: record.chain_id,
                });
            }
        }
        if needs_resync(status.as_ref(), record) {
            info!(
                block = record.number,
                last_processed = status.as_ref().map(|s| s.block_number),
                "continuity lost, snap-syncing from chain state"
            );
            let entities = self
                .snapshots
                .entities()
                .map_err(IngestError::Snapshot)?;
            self.store
                .snap_sync(
                    record.chain_id,
                    record.number.saturating_sub(1),
                    record.parent_hash,
                    &entities,
                )
                .await?;
        }
        self.store.apply_block(record).await?;
        info!(block = record.number, ops = record.ops.len(), "block applied");
        Ok(())
    }

    fn publish_timing(&mut self, record: &BlockRecord) {
        let duration = match self.last_timestamp {
            Some(last) if record.timestamp > last => {
                Duration::from_secs(record.timestamp - last)
            }
            _ => self.timing_tx.borrow().duration,
        };
        self.last_timestamp = Some(record.timestamp);
        self.timing_tx.send_replace(BlockTiming {
            current_block: record.number,
            current_block_time: record.timestamp,
            duration,
        });
    }
}
