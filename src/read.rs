//! The read-path API: cursor-paginated queries over the mirror, count and
//! slot accounting, and block timing.
//!
//! A query resolves its target block (waiting briefly for blocks just past
//! the head), compiles to a plan, and walks the result rows hydrating the
//! requested columns. Two caps bound a page: the caller's
//! `results_per_page` and the response-size ceiling. Hitting either stops
//! the page and returns the cursor of the last included row; an exhausted
//! response returns no cursor.

use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cursor::{Cursor, CursorColumn, CursorError, CursorValue},
    entity::EntityRecord,
    ingest::BlockTiming,
    parser::{parse_query, ParseError},
    plan::{compile, OrderBy, OrderSpec, PlanError, QueryPlan, SqlValue},
    store::{IndexStore, StoreError},
    BlockNumber, EntityKey, IndexerConfig, NumericAnnotation, StringAnnotation, VersionCoords,
    VersionId,
};

/// Errors surfacing from the read path, tagged per failure class.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The query text failed to parse.
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    /// The expression failed to compile.
    #[error("plan: {0}")]
    Plan(#[from] PlanError),
    /// The cursor token failed to decode or validate.
    #[error("cursor: {0}")]
    Cursor(#[from] CursorError),
    /// The request pins a different block than its cursor.
    #[error("cursor was issued at block {cursor}, request pins block {requested}")]
    CursorBlockMismatch {
        /// Block carried by the cursor.
        cursor: BlockNumber,
        /// Block the caller asked for.
        requested: BlockNumber,
    },
    /// The target block is still beyond the head after the wait budget.
    #[error("requested block is in the future")]
    FutureBlock,
    /// The caller cancelled; the read transaction was abandoned.
    #[error("query cancelled")]
    Cancelled,
    /// The mirror failed underneath.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which columns a query materialises into [`EntityData`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Projection {
    /// Entity key.
    pub key: bool,
    /// Decompressed payload bytes.
    pub payload: bool,
    /// Content type.
    pub content_type: bool,
    /// Expiration block.
    pub expiration: bool,
    /// Current owner.
    pub owner: bool,
    /// String and numeric annotations, via per-row follow-up queries.
    pub attributes: bool,
    /// Also hydrate the `$`-prefixed synthetic annotations.
    pub synthetic_attributes: bool,
    /// Creation block.
    pub created_at_block: bool,
    /// Last modification block.
    pub last_modified_at_block: bool,
    /// Transaction index within the modifying block.
    pub transaction_index_in_block: bool,
    /// Operation index within the modifying transaction.
    pub operation_index_in_transaction: bool,
}

impl Projection {
    /// Everything except synthetic annotations.
    pub fn all() -> Self {
        Self {
            key: true,
            payload: true,
            content_type: true,
            expiration: true,
            owner: true,
            attributes: true,
            synthetic_attributes: false,
            created_at_block: true,
            last_modified_at_block: true,
            transaction_index_in_block: true,
            operation_index_in_transaction: true,
        }
    }
}

/// Options of one query call.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Target block; `None` reads at the head. Blocks slightly past the
    /// head wait for the chain; blocks far past it fail.
    pub at_block: Option<BlockNumber>,
    /// Columns to materialise.
    pub include: Projection,
    /// Annotation columns to order by, ahead of the default tuple.
    pub order_by: Vec<OrderBy>,
    /// Row cap per page; 0 means unbounded.
    pub results_per_page: u64,
    /// Resume token from a previous truncated page.
    pub cursor: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            at_block: None,
            include: Projection::all(),
            order_by: Vec::new(),
            results_per_page: 0,
            cursor: None,
        }
    }
}

/// One result row: the requested subset of columns, absent columns `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EntityData {
    /// Entity key.
    pub key: Option<EntityKey>,
    /// Decompressed payload.
    pub payload: Option<Bytes>,
    /// Content type (defaulted for rows that predate the column).
    pub content_type: Option<String>,
    /// Expiration block.
    pub expires_at_block: Option<BlockNumber>,
    /// Current owner.
    pub owner: Option<Address>,
    /// Creation block.
    pub created_at_block: Option<BlockNumber>,
    /// Last modification block.
    pub last_modified_at_block: Option<BlockNumber>,
    /// Transaction index within the modifying block.
    pub transaction_index_in_block: Option<u64>,
    /// Operation index within the modifying transaction.
    pub operation_index_in_transaction: Option<u64>,
    /// String annotations, if requested.
    pub string_annotations: Option<Vec<StringAnnotation>>,
    /// Numeric annotations, if requested.
    pub numeric_annotations: Option<Vec<NumericAnnotation>>,
}

/// One page of query results.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryOutput {
    /// Result rows in plan order.
    pub data: Vec<EntityData>,
    /// Block the page was resolved at; feed it back (or the cursor) for a
    /// stable snapshot across pages.
    pub block_number: BlockNumber,
    /// Resume token; present only when the page was truncated by a cap.
    pub cursor: Option<String>,
}

/// Query front-end over one [`IndexStore`]. Many may serve concurrently;
/// reads never block the ingester.
#[derive(Debug)]
pub struct ReadApi {
    store: Arc<IndexStore>,
    timing: watch::Receiver<BlockTiming>,
    max_response_bytes: usize,
    block_wait_factor: u32,
}

impl ReadApi {
    /// A read API over `store`, watching the ingester's `timing` feed.
    pub fn new(
        store: Arc<IndexStore>,
        timing: watch::Receiver<BlockTiming>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            store,
            timing,
            max_response_bytes: config.max_response_bytes,
            block_wait_factor: config.block_wait_factor,
        }
    }

    /// Head-of-chain timing as last observed by the ingester.
    pub fn block_timing(&self) -> BlockTiming {
        *self.timing.borrow()
    }

    /// Total state-slot allocation visible in the mirror.
    pub async fn used_slots(&self) -> Result<U256, QueryError> {
        Ok(U256::from(self.store.used_slots().await?))
    }

    /// Number of live entities at `at_block` (head when `None`).
    pub async fn entity_count(
        &self,
        at_block: Option<BlockNumber>,
    ) -> Result<u64, QueryError> {
        let block = self.resolve_block(at_block).await?;
        Ok(self.store.entity_count(Some(block)).await?)
    }

    /// Run `expr` and return one page of hydrated results.
    pub async fn query(
        &self,
        expr: &str,
        options: &QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<QueryOutput, QueryError> {
        let cursor = options
            .cursor
            .as_deref()
            .map(Cursor::decode)
            .transpose()?;

        // The cursor pins the snapshot block of the whole page sequence.
        let at_block = match &cursor {
            Some(cursor) => {
                if let Some(requested) = options.at_block {
                    if requested != cursor.at_block {
                        return Err(QueryError::CursorBlockMismatch {
                            cursor: cursor.at_block,
                            requested,
                        });
                    }
                }
                cursor.at_block
            }
            None => self.resolve_block(options.at_block).await?,
        };

        let parsed = parse_query(expr)?;
        let plan = compile(&parsed, at_block, &options.order_by, cursor.as_ref())?;
        debug!(at_block, ctes = plan.sql.matches(" AS (").count(), "compiled query");

        let rows = self.fetch_plan(&plan, options.results_per_page, cancel).await?;

        let mut data = Vec::new();
        let mut last_positions: Option<Vec<CursorColumn>> = None;
        let mut truncated = false;
        let mut response_bytes = 0usize;
        for row in &rows {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            if options.results_per_page > 0 && data.len() as u64 == options.results_per_page {
                truncated = true;
                break;
            }
            let (id, positions) = decode_plan_row(row, &plan.order)?;
            let entity = self.hydrate(&id, &options.include).await?;
            let entity_bytes = approximate_size(&entity);
            if !data.is_empty() && response_bytes + entity_bytes > self.max_response_bytes {
                truncated = true;
                break;
            }
            response_bytes += entity_bytes;
            data.push(entity);
            last_positions = Some(positions);
        }

        let cursor = if truncated {
            last_positions.map(|positions| {
                Cursor {
                    at_block,
                    positions,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(QueryOutput {
            data,
            block_number: at_block,
            cursor,
        })
    }

    async fn fetch_plan(
        &self,
        plan: &QueryPlan,
        results_per_page: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<SqliteRow>, QueryError> {
        // One row past the cap is enough to learn whether the page is
        // truncated without walking the whole result set.
        let sql = if results_per_page > 0 {
            format!("{} LIMIT {}", plan.sql, results_per_page.saturating_add(1))
        } else {
            plan.sql.clone()
        };
        let mut query = sqlx::query(&sql);
        for arg in &plan.args {
            query = match arg {
                SqlValue::Int(value) => query.bind(*value),
                SqlValue::Text(value) => query.bind(value.clone()),
            };
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            rows = query.fetch_all(self.store.reader()) => {
                rows.map_err(|err| QueryError::Store(err.into()))
            }
        }
    }

    async fn hydrate(
        &self,
        id: &VersionId,
        include: &Projection,
    ) -> Result<EntityData, QueryError> {
        let record = self
            .store
            .version_row(id)
            .await?
            .ok_or(StoreError::MissingPriorVersion(id.key))?;
        let mut entity = project(&record, include);
        if include.attributes {
            let (strings, numerics) = self
                .store
                .version_annotations(id, include.synthetic_attributes)
                .await?;
            entity.string_annotations = Some(strings);
            entity.numeric_annotations = Some(numerics);
        }
        Ok(entity)
    }

    // The head the read path trusts: whatever the store has committed, or
    // the ingester's live feed when it is ahead of a fresh handle.
    async fn head(&self) -> Result<BlockNumber, QueryError> {
        let committed = self
            .store
            .processing_status()
            .await?
            .map(|status| status.block_number)
            .unwrap_or(0);
        Ok(committed.max(self.timing.borrow().current_block))
    }

    async fn resolve_block(
        &self,
        requested: Option<BlockNumber>,
    ) -> Result<BlockNumber, QueryError> {
        let head = self.head().await?;
        let Some(target) = requested else {
            return Ok(head);
        };
        if target <= head {
            return Ok(target);
        }

        // Just past the head: give the chain a couple of block cadences to
        // catch up before declaring the block unreachable.
        let mut timing = self.timing.clone();
        let budget = timing.borrow().duration * self.block_wait_factor;
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if timing.borrow_and_update().current_block >= target {
                return Ok(target);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(QueryError::FutureBlock);
            }
            match tokio::time::timeout(remaining, timing.changed()).await {
                Ok(Ok(())) => {}
                // Timed out, or the ingester went away entirely.
                Ok(Err(_)) | Err(_) => return Err(QueryError::FutureBlock),
            }
        }
    }
}

// Plan rows carry the version tuple first and the order-by annotation
// columns after it, in order-spec order.
fn decode_plan_row(
    row: &SqliteRow,
    order: &[OrderSpec],
) -> Result<(VersionId, Vec<CursorColumn>), QueryError> {
    let key_text: String = row.try_get(0).map_err(StoreError::from)?;
    let key = B256::from_str(&key_text)
        .map_err(|_| StoreError::Corrupt(format!("entity key {key_text:?}")))?;
    let coords = VersionCoords::new(
        row.try_get::<i64, _>(1).map_err(StoreError::from)? as u64,
        row.try_get::<i64, _>(2).map_err(StoreError::from)? as u64,
        row.try_get::<i64, _>(3).map_err(StoreError::from)? as u64,
    );

    let mut positions = Vec::with_capacity(order.len());
    let mut annotation_column = 4usize;
    for spec in order {
        let value = if spec.annotation {
            let value = if spec.numeric {
                CursorValue::Num(
                    row.try_get::<i64, _>(annotation_column)
                        .map_err(StoreError::from)? as u64,
                )
            } else {
                CursorValue::Text(
                    row.try_get::<String, _>(annotation_column)
                        .map_err(StoreError::from)?,
                )
            };
            annotation_column += 1;
            value
        } else {
            match spec.column.as_str() {
                "last_modified_at_block" => CursorValue::Num(coords.block_number),
                "tx_index" => CursorValue::Num(coords.tx_index),
                _ => CursorValue::Num(coords.op_index),
            }
        };
        positions.push(CursorColumn {
            name: spec.column.clone(),
            value,
            descending: spec.descending,
        });
    }
    Ok((VersionId { key, coords }, positions))
}

fn project(record: &EntityRecord, include: &Projection) -> EntityData {
    EntityData {
        key: include.key.then_some(record.key),
        payload: include.payload.then(|| record.payload.clone()),
        content_type: include.content_type.then(|| record.content_type.clone()),
        expires_at_block: include.expiration.then_some(record.expires_at),
        owner: include.owner.then_some(record.owner),
        created_at_block: include.created_at_block.then_some(record.created_at),
        last_modified_at_block: include
            .last_modified_at_block
            .then_some(record.coords.block_number),
        transaction_index_in_block: include
            .transaction_index_in_block
            .then_some(record.coords.tx_index),
        operation_index_in_transaction: include
            .operation_index_in_transaction
            .then_some(record.coords.op_index),
        string_annotations: None,
        numeric_annotations: None,
    }
}

// Rough page-size accounting: payload and text dominate, everything else
// is charged a small fixed overhead.
fn approximate_size(entity: &EntityData) -> usize {
    let mut size = 64;
    if let Some(payload) = &entity.payload {
        size += payload.len();
    }
    if let Some(content_type) = &entity.content_type {
        size += content_type.len();
    }
    if let Some(annotations) = &entity.string_annotations {
        for annotation in annotations {
            size += annotation.key.len() + annotation.value.len() + 8;
        }
    }
    if let Some(annotations) = &entity.numeric_annotations {
        for annotation in annotations {
            size += annotation.key.len() + 16;
        }
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn projection_masks_columns() {
        let record = EntityRecord {
            key: B256::repeat_byte(1),
            payload: Bytes::from_static(b"payload"),
            content_type: "text/plain".into(),
            owner: address!("00000000000000000000000000000000000000a1"),
            creator: address!("00000000000000000000000000000000000000a1"),
            expires_at: 101,
            created_at: 1,
            coords: VersionCoords::new(1, 2, 3),
            deleted: false,
            string_annotations: Vec::new(),
            numeric_annotations: Vec::new(),
        };

        let full = project(&record, &Projection::all());
        assert_eq!(full.key, Some(record.key));
        assert_eq!(
            full.payload.as_ref().map(|p| p.as_ref()),
            Some(b"payload".as_slice())
        );
        assert_eq!(full.transaction_index_in_block, Some(2));

        let only_key = project(
            &record,
            &Projection {
                key: true,
                ..Projection::default()
            },
        );
        assert_eq!(only_key.key, Some(record.key));
        assert_eq!(only_key.payload, None);
        assert_eq!(only_key.owner, None);
    }

    #[test]
    fn size_accounting_tracks_payload_and_annotations() {
        let mut entity = EntityData {
            payload: Some(Bytes::from(vec![0u8; 1000])),
            ..EntityData::default()
        };
        let base = approximate_size(&entity);
        assert!(base >= 1000);
        entity.string_annotations = Some(vec![StringAnnotation::new("k", "v".to_owned())]);
        assert!(approximate_size(&entity) > base);
    }
}
