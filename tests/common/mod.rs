//! A minimal simulated chain: executes mutation batches against in-memory
//! chain state, assembles blocks and receipts the way the node would, and
//! feeds them to the ingester. Shared by the lifecycle and query tests.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use alloy_chains::Chain;
use alloy_primitives::{keccak256, Address, Bytes, B256};
use arkiv_index::{
    encode_transaction_input, execute_batch, expiration_batch, ArkivTransaction, ChainBlock,
    ChainTransaction, ExecutionContext, ExecutorError, IndexStore, IndexerConfig, Ingester,
    MemoryView, ReadApi, SnapshotEntity, SnapshotSource, TxReceipt, ViewError, WireCreate,
    WireNumericAnnotation, WireStringAnnotation, ARKIV_ADDRESS,
};
use tokio_util::sync::CancellationToken;

pub const CHAIN_ID: u64 = 1337;
pub const GENESIS_TIME: u64 = 1_700_000_000;
pub const BLOCK_CADENCE: u64 = 2;

/// Chain state shared between the block builder and the ingester's
/// snapshot source.
#[derive(Clone, Default)]
pub struct SharedView(pub Arc<Mutex<MemoryView>>);

impl SnapshotSource for SharedView {
    fn entities(&self) -> Result<Vec<SnapshotEntity>, ViewError> {
        self.0.lock().unwrap().entities()
    }
}

/// Result of one submitted transaction.
pub struct TxOutcome {
    pub hash: B256,
    pub error: Option<ExecutorError>,
}

pub struct TestChain {
    pub view: SharedView,
    pub store: Arc<IndexStore>,
    pub ingester: Ingester<SharedView>,
    pub api: ReadApi,
    pub head: u64,
    pub parent_hash: B256,
    _dir: tempfile::TempDir,
}

impl TestChain {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arkiv.db");
        let store = IndexStore::open(path.to_str().unwrap()).await.unwrap();
        let view = SharedView::default();
        let config = IndexerConfig::default();
        let ingester = Ingester::new(
            store.clone(),
            view.clone(),
            Chain::from_id(CHAIN_ID),
            &config,
        );
        let api = ReadApi::new(store.clone(), ingester.timing(), &config);
        Self {
            view,
            store,
            ingester,
            api,
            head: 0,
            parent_hash: B256::ZERO,
            _dir: dir,
        }
    }

    /// Execute `batches` as the next block (housekeeping deposit first,
    /// then one Arkiv transaction per batch) and ingest it. Chain state
    /// advances only after the block is committed, so a snap-sync during
    /// the ingest sees the parent state, exactly like iterating the real
    /// chain at the parent block.
    pub async fn produce_block(
        &mut self,
        batches: Vec<(Address, ArkivTransaction)>,
    ) -> Vec<TxOutcome> {
        let (block, receipts, outcomes, staged) = self.build_block(batches);
        self.ingester
            .ingest(&block, &receipts, &CancellationToken::new())
            .await
            .unwrap();
        *self.view.0.lock().unwrap() = staged;
        outcomes
    }

    /// Execute a block against chain state only, without ingesting, as if
    /// the indexer were offline. The next ingested block then has a gap
    /// and forces a snap-sync.
    pub fn skip_block(&mut self, batches: Vec<(Address, ArkivTransaction)>) -> Vec<TxOutcome> {
        let (_, _, outcomes, staged) = self.build_block(batches);
        *self.view.0.lock().unwrap() = staged;
        outcomes
    }

    fn build_block(
        &mut self,
        batches: Vec<(Address, ArkivTransaction)>,
    ) -> (ChainBlock, Vec<TxReceipt>, Vec<TxOutcome>, MemoryView) {
        let number = self.head + 1;
        let mut staged = self.view.0.lock().unwrap().clone();
        let mut transactions = Vec::new();
        let mut receipts = Vec::new();
        let mut outcomes = Vec::new();
        let mut tx_index = 0u64;

        // Housekeeping rides a deposit transaction at the head of the
        // block, like any other system-originated work.
        let expirations = expiration_batch(&staged, number, tx_index).unwrap();
        if !expirations.ops.is_empty() {
            staged.apply_ops(&expirations.ops);
            transactions.push(ChainTransaction {
                hash: tx_hash(number, tx_index),
                sender: Address::ZERO,
                to: None,
                input: Bytes::new(),
                deposit: true,
            });
            receipts.push(TxReceipt {
                success: true,
                logs: expirations.logs,
            });
            tx_index += 1;
        }

        for (sender, batch) in batches {
            let hash = tx_hash(number, tx_index);
            let context = ExecutionContext {
                block_number: number,
                tx_hash: hash,
                tx_index,
                sender,
            };
            transactions.push(ChainTransaction {
                hash,
                sender,
                to: Some(ARKIV_ADDRESS),
                input: encode_transaction_input(&batch),
                deposit: false,
            });
            match execute_batch(&staged, &context, &batch) {
                Ok(executed) => {
                    staged.apply_ops(&executed.ops);
                    receipts.push(TxReceipt {
                        success: true,
                        logs: executed.logs,
                    });
                    outcomes.push(TxOutcome { hash, error: None });
                }
                Err(error) => {
                    // A failed batch leaves a failed receipt and no logs.
                    receipts.push(TxReceipt {
                        success: false,
                        logs: Vec::new(),
                    });
                    outcomes.push(TxOutcome {
                        hash,
                        error: Some(error),
                    });
                }
            }
            tx_index += 1;
        }

        let hash = block_hash(self.parent_hash, number);
        let block = ChainBlock {
            chain_id: CHAIN_ID,
            number,
            hash,
            parent_hash: self.parent_hash,
            timestamp: GENESIS_TIME + number * BLOCK_CADENCE,
            transactions,
        };
        self.head = number;
        self.parent_hash = hash;
        (block, receipts, outcomes, staged)
    }
}

pub fn block_hash(parent: B256, number: u64) -> B256 {
    keccak256([parent.as_slice(), &number.to_be_bytes()].concat())
}

pub fn tx_hash(block: u64, tx_index: u64) -> B256 {
    keccak256([block.to_be_bytes(), tx_index.to_be_bytes()].concat())
}

pub fn create_batch(
    btl: u64,
    payload: &[u8],
    strings: &[(&str, &str)],
    numerics: &[(&str, u64)],
) -> ArkivTransaction {
    ArkivTransaction {
        creates: vec![WireCreate {
            btl,
            content_type: "text/plain".into(),
            payload: Bytes::copy_from_slice(payload),
            string_annotations: strings
                .iter()
                .map(|(key, value)| WireStringAnnotation {
                    key: (*key).into(),
                    value: (*value).into(),
                })
                .collect(),
            numeric_annotations: numerics
                .iter()
                .map(|(key, value)| WireNumericAnnotation {
                    key: (*key).into(),
                    value: *value,
                })
                .collect(),
        }],
        ..Default::default()
    }
}

pub fn alice() -> Address {
    Address::repeat_byte(0xa1)
}

pub fn bob() -> Address {
    Address::repeat_byte(0xb0)
}

/// The key the executor derives for the first create of `tx`.
pub fn derived_key(tx: B256, payload: &[u8]) -> B256 {
    keccak256([tx.as_slice(), payload, &[0u8; 32]].concat())
}
