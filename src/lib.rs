//! Off-chain indexing and query core for Arkiv, a chain-backed entity store.
//!
//! On-chain transactions addressed to [`ARKIV_ADDRESS`] carry batches of
//! entity mutations. This crate interprets those batches ([`execute_batch`]),
//! folds them block by block into a relational mirror ([`Ingester`],
//! [`IndexStore`]), and serves a boolean predicate language over entity
//! annotations compiled to set-algebra SQL ([`parse_query`], [`compile`],
//! [`ReadApi`]).

use std::time::Duration;

use alloy_primitives::{address, Address};
use serde::Deserialize;

/// Block height on the underlying chain.
pub type BlockNumber = u64;

/// Index of a transaction within its block.
pub type TxIndex = u64;

/// Index of an operation within its transaction's mutation batch,
/// counted across all operation lists in execution order.
pub type OpIndex = u64;

/// The reserved system account mutation batches are addressed to.
/// Transactions to any other destination are invisible to the indexer.
pub const ARKIV_ADDRESS: Address = address!("0000000000000000000000000000000060138453");

/// Hard ceiling on any brotli decompression the core performs, both for
/// transaction data at ingest and for payloads on the read path.
pub const MAX_DECOMPRESSED_BYTES: usize = 20 * 1024 * 1024;

/// Maximum length of an entity's content type, in bytes.
pub const MAX_CONTENT_TYPE_BYTES: usize = 128;

/// Content type reported for rows that predate the column.
/// Writes still require a non-empty value.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Tuning knobs of the indexer. Loading these from files or flags is the
/// embedder's concern; the defaults match a single-node deployment.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// How many blocks of version history to retain. 0 disables garbage
    /// collection entirely.
    pub retention_blocks: u64,
    /// How often the garbage collector wakes up.
    pub gc_interval: Duration,
    /// Minimum number of garbage rows before a collection pass bothers
    /// to take the writer lock.
    pub gc_floor: u64,
    /// Response size ceiling for one query page.
    pub max_response_bytes: usize,
    /// Fixed delay between ingest retries on transient storage errors.
    pub retry_backoff: Duration,
    /// Future-block reads wait up to this many observed block cadences
    /// before failing.
    pub block_wait_factor: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            retention_blocks: 0,
            gc_interval: Duration::from_secs(60),
            gc_floor: 100,
            max_response_bytes: 512 * 1024,
            retry_backoff: Duration::from_millis(500),
            block_wait_factor: 2,
        }
    }
}

mod entity;
pub use entity::{
    is_valid_annotation_key, Annotation, EntityKey, EntityRecord, NumericAnnotation,
    StringAnnotation, VersionCoords, VersionId, SYNTHETIC_CREATOR, SYNTHETIC_EXPIRATION,
    SYNTHETIC_KEY, SYNTHETIC_OWNER, SYNTHETIC_SEQUENCE,
};
mod wire;
pub use wire::{
    brotli_compress, brotli_decompress, decode_transaction_input, encode_transaction_input,
    ArkivTransaction, WireChangeOwner, WireCreate, WireError, WireExtend, WireNumericAnnotation,
    WireStringAnnotation, WireUpdate,
};
mod events;
pub use events::{decode_arkiv_log, ArkivEvent, EventError};
mod executor;
pub use executor::{
    execute_batch, expiration_batch, CanonicalChangeOwner, CanonicalCreate, CanonicalDelete,
    CanonicalExtend, CanonicalOp, CanonicalUpdate, EntityView, ExecutedBatch, ExecutionContext,
    ExecutorError, MemoryView, OpKind, ViewError,
};
mod ingest;
pub use ingest::{
    canonicalise, BlockRecord, BlockTiming, ChainBlock, ChainTransaction, IngestError, Ingester,
    SnapshotEntity, SnapshotSource, TxReceipt,
};
mod store;
pub use store::{IndexStore, ProcessingStatus, StoreError};
mod gc;
pub use gc::spawn_gc;
mod lexer;
pub use lexer::{Token, TokenKind, Tokenizer};
mod parser;
pub use parser::{normalise, parse_query, Comparator, Expr, ParseError, Predicate, PredicateValue};
mod plan;
pub use plan::{compile, OrderBy, OrderSpec, PlanError, QueryPlan, SqlValue};
mod cursor;
pub use cursor::{Cursor, CursorColumn, CursorError, CursorValue};
mod read;
pub use read::{EntityData, Projection, QueryError, QueryOptions, QueryOutput, ReadApi};
