//! The temporal indexed store: an append-only relational mirror in SQLite.
//!
//! Every mutation inserts a new row at `(key, last_modified_at_block,
//! tx_index, op_index)`; prior rows stay until garbage collection, which is
//! what makes "as-of-block" reads a plain maximum-row lookup. The store
//! exposes two handles: a single write connection serialised behind an
//! async mutex (held by the ingester or the garbage collector, released at
//! block boundaries) and a multi-connection read pool. WAL journaling lets
//! readers keep a stable snapshot while a block commits.

use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, SqliteConnection,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    entity::EntityRecord,
    executor::{CanonicalOp, CanonicalCreate, CanonicalUpdate},
    ingest::{BlockRecord, SnapshotEntity},
    wire::{brotli_compress, brotli_decompress},
    Annotation, BlockNumber, EntityKey, NumericAnnotation, StringAnnotation, VersionCoords,
    VersionId, DEFAULT_CONTENT_TYPE, MAX_DECOMPRESSED_BYTES, SYNTHETIC_CREATOR,
    SYNTHETIC_EXPIRATION, SYNTHETIC_KEY, SYNTHETIC_OWNER, SYNTHETIC_SEQUENCE,
};

// Bumped whenever the entity/annotation table layout changes; a mismatch
// on open drops and recreates the data tables.
const ENTITIES_SCHEMA_VERSION: i64 = 1;

// A newer version of the same key exists at or before the bound block.
// `?1` is always the at-block parameter. Shared with the query compiler so
// the point-in-time rule has exactly one spelling.
pub(crate) const LATER_VERSION_AT: &str = "EXISTS (SELECT 1 FROM entities later \
     WHERE later.key = e.key AND later.last_modified_at_block <= ?1 \
     AND (later.last_modified_at_block > e.last_modified_at_block \
     OR (later.last_modified_at_block = e.last_modified_at_block \
     AND (later.tx_index > e.tx_index \
     OR (later.tx_index = e.tx_index AND later.op_index > e.op_index)))))";

const ENTITY_COLUMNS: &str = "key, expires_at_block, payload, content_type, created_at_block, \
     last_modified_at_block, tx_index, op_index, deleted, owner_address, creator_address";

/// Errors from the relational mirror.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure; transient from the ingester's point of
    /// view.
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    /// The block does not extend the processed chain. The ingester resolves
    /// this by resyncing, not by surfacing it.
    #[error("block {number} does not extend the processed chain")]
    Continuity {
        /// Rejected block height.
        number: BlockNumber,
    },
    /// The store is already bound to a different network.
    #[error("store is bound to network {bound}, got network {got}")]
    NetworkMismatch {
        /// Bound chain id.
        bound: u64,
        /// Offered chain id.
        got: u64,
    },
    /// An operation references an entity with no version rows.
    #[error("no prior version for entity {0}")]
    MissingPriorVersion(EntityKey),
    /// A stored payload failed to decompress.
    #[error("payload of entity {key}: {reason}")]
    Payload {
        /// Owning entity.
        key: EntityKey,
        /// What went wrong.
        reason: String,
    },
    /// A stored column does not parse back into its model type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// The recorded ingestion watermark: exactly one row, one network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessingStatus {
    /// Chain id the store is bound to.
    pub network: u64,
    /// Last applied block height.
    pub block_number: BlockNumber,
    /// Last applied block hash.
    pub block_hash: B256,
}

/// Handle to the mirror database. Cheap to clone through [`Arc`]; all
/// methods take `&self`.
#[derive(Debug)]
pub struct IndexStore {
    writer: SqlitePool,
    reader: SqlitePool,
    write_lock: Mutex<()>,
}

impl IndexStore {
    /// Open (creating if missing) the mirror database at `path` and bring
    /// the schema up to the current version.
    pub async fn open(path: &str) -> Result<Arc<Self>, StoreError> {
        let base = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base.clone().create_if_missing(true))
            .await?;
        ensure_schema(&writer).await?;
        // Readers connect lazily, after the writer has created the file
        // and the schema.
        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_lazy_with(base.pragma("query_only", "true"));
        Ok(Arc::new(Self {
            writer,
            reader,
            write_lock: Mutex::new(()),
        }))
    }

    /// The read pool, for the query planner's own statements.
    pub(crate) fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// The recorded processing watermark, if any block was ever applied.
    pub async fn processing_status(&self) -> Result<Option<ProcessingStatus>, StoreError> {
        status_on(&self.writer).await
    }

    /// Apply one block record atomically: verify continuity, insert every
    /// operation's version rows, advance the watermark. Rolls back wholly
    /// on any error, so readers never observe a partial block.
    pub async fn apply_block(&self, record: &BlockRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.writer.begin().await?;

        let status = status_in(&mut *tx).await?;
        match &status {
            Some(status) => {
                if status.network != record.chain_id {
                    return Err(StoreError::NetworkMismatch {
                        bound: status.network,
                        got: record.chain_id,
                    });
                }
                if status.block_number.saturating_add(1) != record.number
                    || status.block_hash != record.parent_hash
                {
                    return Err(StoreError::Continuity {
                        number: record.number,
                    });
                }
            }
            None if record.number != 1 => {
                return Err(StoreError::Continuity {
                    number: record.number,
                })
            }
            None => {}
        }

        for op in &record.ops {
            apply_op(&mut *tx, op).await?;
        }
        put_status(&mut *tx, record.chain_id, record.number, record.hash).await?;
        tx.commit().await?;
        debug!(block = record.number, "committed block record");
        Ok(())
    }

    /// Rebuild the mirror wholesale from a chain-side snapshot taken at
    /// `(parent_number, parent_hash)`: drop all entity and annotation rows,
    /// insert the snapshot, move the watermark to the parent.
    pub async fn snap_sync(
        &self,
        network: u64,
        parent_number: BlockNumber,
        parent_hash: B256,
        entities: &[SnapshotEntity],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.writer.begin().await?;

        sqlx::query("DELETE FROM string_annotations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM numeric_annotations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM entities")
            .execute(&mut *tx)
            .await?;

        for entity in entities {
            insert_entity_row(
                &mut *tx,
                &EntityRow {
                    key: entity.key,
                    expires_at: entity.expires_at,
                    compressed_payload: entity.compressed_payload.to_vec(),
                    content_type: entity.content_type.clone(),
                    created_at: entity.created_at,
                    coords: entity.coords,
                    deleted: false,
                    owner: entity.owner,
                    creator: entity.creator,
                },
            )
            .await?;
            insert_user_annotations(
                &mut *tx,
                entity.key,
                entity.coords,
                &entity.string_annotations,
                &entity.numeric_annotations,
            )
            .await?;
            insert_synthetic_annotations(
                &mut *tx,
                entity.key,
                entity.coords,
                entity.owner,
                entity.creator,
                entity.expires_at,
            )
            .await?;
        }

        put_status(&mut *tx, network, parent_number, parent_hash).await?;
        tx.commit().await?;
        info!(
            entities = entities.len(),
            parent = parent_number,
            "snap-sync complete"
        );
        Ok(())
    }

    /// The latest version of `key` at `at_block` (unbounded when `None`),
    /// tombstones included, with annotations and decompressed payload.
    pub async fn latest_version(
        &self,
        key: &EntityKey,
        at_block: Option<BlockNumber>,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let bound = block_bound(at_block);
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE key = ?1 AND last_modified_at_block <= ?2 \
             ORDER BY last_modified_at_block DESC, tx_index DESC, op_index DESC LIMIT 1"
        ))
        .bind(hex(key))
        .bind(bound)
        .fetch_optional(&self.reader)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = row_to_record(&row)?;
        if !record.deleted {
            let (strings, numerics) = self
                .version_annotations(
                    &VersionId {
                        key: record.key,
                        coords: record.coords,
                    },
                    false,
                )
                .await?;
            record.string_annotations = strings;
            record.numeric_annotations = numerics;
        }
        Ok(Some(record))
    }

    /// One specific version row, without annotations.
    pub async fn version_row(&self, id: &VersionId) -> Result<Option<EntityRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities \
             WHERE key = ?1 AND last_modified_at_block = ?2 AND tx_index = ?3 AND op_index = ?4"
        ))
        .bind(hex(&id.key))
        .bind(id.coords.block_number as i64)
        .bind(id.coords.tx_index as i64)
        .bind(id.coords.op_index as i64)
        .fetch_optional(&self.reader)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Annotations of one version row, split by family and ordered by key.
    /// Synthetic (`$`-prefixed) rows are filtered out unless requested.
    pub async fn version_annotations(
        &self,
        id: &VersionId,
        include_synthetic: bool,
    ) -> Result<(Vec<StringAnnotation>, Vec<NumericAnnotation>), StoreError> {
        let synthetic_filter = if include_synthetic {
            ""
        } else {
            "AND substr(annotation_key, 1, 1) != '$' "
        };
        let strings = sqlx::query(&format!(
            "SELECT annotation_key, value FROM string_annotations \
             WHERE entity_key = ?1 AND entity_last_modified_at_block = ?2 \
             AND entity_tx_index = ?3 AND entity_op_index = ?4 {synthetic_filter}\
             ORDER BY annotation_key"
        ))
        .bind(hex(&id.key))
        .bind(id.coords.block_number as i64)
        .bind(id.coords.tx_index as i64)
        .bind(id.coords.op_index as i64)
        .fetch_all(&self.reader)
        .await?
        .iter()
        .map(|row| {
            Ok(Annotation::new(
                row.try_get::<String, _>(0)?,
                row.try_get::<String, _>(1)?,
            ))
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let numerics = sqlx::query(&format!(
            "SELECT annotation_key, value FROM numeric_annotations \
             WHERE entity_key = ?1 AND entity_last_modified_at_block = ?2 \
             AND entity_tx_index = ?3 AND entity_op_index = ?4 {synthetic_filter}\
             ORDER BY annotation_key"
        ))
        .bind(hex(&id.key))
        .bind(id.coords.block_number as i64)
        .bind(id.coords.tx_index as i64)
        .bind(id.coords.op_index as i64)
        .fetch_all(&self.reader)
        .await?
        .iter()
        .map(|row| {
            Ok(Annotation::new(
                row.try_get::<String, _>(0)?,
                row.try_get::<i64, _>(1)? as u64,
            ))
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok((strings, numerics))
    }

    /// Number of distinct live entities at `at_block` (head when `None`).
    pub async fn entity_count(&self, at_block: Option<BlockNumber>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM entities e \
             WHERE e.deleted = 0 AND e.last_modified_at_block <= ?1 AND NOT {LATER_VERSION_AT}"
        ))
        .bind(block_bound(at_block))
        .fetch_one(&self.reader)
        .await?;
        Ok(count as u64)
    }

    /// Total state-slot allocation visible in the mirror: live entity
    /// version rows plus their annotation rows.
    pub async fn used_slots(&self) -> Result<u64, StoreError> {
        let live = "e.deleted = 0 AND NOT EXISTS (SELECT 1 FROM entities later \
             WHERE later.key = e.key \
             AND (later.last_modified_at_block > e.last_modified_at_block \
             OR (later.last_modified_at_block = e.last_modified_at_block \
             AND (later.tx_index > e.tx_index \
             OR (later.tx_index = e.tx_index AND later.op_index > e.op_index)))))";
        let join = "JOIN entities e ON e.key = a.entity_key \
             AND e.last_modified_at_block = a.entity_last_modified_at_block \
             AND e.tx_index = a.entity_tx_index AND e.op_index = a.entity_op_index";
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT (SELECT COUNT(*) FROM entities e WHERE {live}) \
             + (SELECT COUNT(*) FROM string_annotations a {join} WHERE {live}) \
             + (SELECT COUNT(*) FROM numeric_annotations a {join} WHERE {live})"
        ))
        .fetch_one(&self.reader)
        .await?;
        Ok(total as u64)
    }

    /// One garbage-collection pass. Version rows last modified at or
    /// before `head − retention` are deleted when they are superseded
    /// within that horizon or tombstoned, so any read at or after the
    /// horizon still resolves. Returns the number of entity rows removed;
    /// passes below `floor` eligible rows are skipped. `retention == 0`
    /// disables collection.
    pub async fn collect_garbage(&self, retention: u64, floor: u64) -> Result<u64, StoreError> {
        if retention == 0 {
            return Ok(0);
        }
        let Some(status) = self.processing_status().await? else {
            return Ok(0);
        };
        if status.block_number <= retention {
            return Ok(0);
        }
        let cutoff = (status.block_number - retention) as i64;

        let garbage = "e.last_modified_at_block <= ?1 AND (e.deleted != 0 \
             OR EXISTS (SELECT 1 FROM entities later \
             WHERE later.key = e.key AND later.last_modified_at_block <= ?1 \
             AND (later.last_modified_at_block > e.last_modified_at_block \
             OR (later.last_modified_at_block = e.last_modified_at_block \
             AND (later.tx_index > e.tx_index \
             OR (later.tx_index = e.tx_index AND later.op_index > e.op_index))))))";

        // Cheap pre-check without the writer lock: skip the pass when the
        // backlog is below the floor.
        let eligible: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM entities e WHERE {garbage}"
        ))
        .bind(cutoff)
        .fetch_one(&self.reader)
        .await?;
        if (eligible as u64) < floor.max(1) {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.writer.begin().await?;
        let victims = format!(
            "SELECT e.key, e.last_modified_at_block, e.tx_index, e.op_index \
             FROM entities e WHERE {garbage}"
        );
        sqlx::query(&format!(
            "DELETE FROM string_annotations WHERE (entity_key, entity_last_modified_at_block, \
             entity_tx_index, entity_op_index) IN ({victims})"
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "DELETE FROM numeric_annotations WHERE (entity_key, entity_last_modified_at_block, \
             entity_tx_index, entity_op_index) IN ({victims})"
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query(&format!(
            "DELETE FROM entities WHERE (key, last_modified_at_block, tx_index, op_index) \
             IN (SELECT key, last_modified_at_block, tx_index, op_index \
             FROM (SELECT e.key, e.last_modified_at_block, e.tx_index, e.op_index \
             FROM entities e WHERE {garbage}))"
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        info!(removed, cutoff, "garbage collection pass");
        Ok(removed)
    }
}

// Internal row shape shared by create/update/tombstone/snapshot inserts.
struct EntityRow {
    key: EntityKey,
    expires_at: BlockNumber,
    compressed_payload: Vec<u8>,
    content_type: String,
    created_at: BlockNumber,
    coords: VersionCoords,
    deleted: bool,
    owner: Address,
    creator: Address,
}

fn hex<T: std::fmt::LowerHex>(value: &T) -> String {
    format!("{value:#x}")
}

fn block_bound(at_block: Option<BlockNumber>) -> i64 {
    at_block.map_or(i64::MAX, |block| block.min(i64::MAX as u64) as i64)
}

fn row_to_record(row: &SqliteRow) -> Result<EntityRecord, StoreError> {
    let key_text: String = row.try_get("key")?;
    let key = B256::from_str(&key_text)
        .map_err(|_| StoreError::Corrupt(format!("entity key {key_text:?}")))?;
    let owner_text: String = row.try_get("owner_address")?;
    let owner = Address::from_str(&owner_text)
        .map_err(|_| StoreError::Corrupt(format!("owner address {owner_text:?}")))?;
    let creator_text: String = row.try_get("creator_address")?;
    let creator = Address::from_str(&creator_text)
        .map_err(|_| StoreError::Corrupt(format!("creator address {creator_text:?}")))?;

    let compressed: Vec<u8> = row.try_get("payload")?;
    let payload = if compressed.is_empty() {
        Bytes::new()
    } else {
        Bytes::from(
            brotli_decompress(&compressed, MAX_DECOMPRESSED_BYTES).map_err(|err| {
                StoreError::Payload {
                    key,
                    reason: err.to_string(),
                }
            })?,
        )
    };

    let content_type: Option<String> = row.try_get("content_type")?;
    let content_type = match content_type {
        Some(value) if !value.is_empty() => value,
        _ => DEFAULT_CONTENT_TYPE.to_owned(),
    };

    Ok(EntityRecord {
        key,
        payload,
        content_type,
        owner,
        creator,
        expires_at: row.try_get::<i64, _>("expires_at_block")? as u64,
        created_at: row.try_get::<i64, _>("created_at_block")? as u64,
        coords: VersionCoords::new(
            row.try_get::<i64, _>("last_modified_at_block")? as u64,
            row.try_get::<i64, _>("tx_index")? as u64,
            row.try_get::<i64, _>("op_index")? as u64,
        ),
        deleted: row.try_get::<i64, _>("deleted")? != 0,
        string_annotations: Vec::new(),
        numeric_annotations: Vec::new(),
    })
}

async fn status_on(pool: &SqlitePool) -> Result<Option<ProcessingStatus>, StoreError> {
    let row = sqlx::query(
        "SELECT network, last_processed_block_number, last_processed_block_hash \
         FROM processing_status WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    row.map(parse_status).transpose()
}

async fn status_in(
    conn: &mut SqliteConnection,
) -> Result<Option<ProcessingStatus>, StoreError> {
    let row = sqlx::query(
        "SELECT network, last_processed_block_number, last_processed_block_hash \
         FROM processing_status WHERE id = 1",
    )
    .fetch_optional(conn)
    .await?;
    row.map(parse_status).transpose()
}

fn parse_status(row: SqliteRow) -> Result<ProcessingStatus, StoreError> {
    let hash_text: String = row.try_get("last_processed_block_hash")?;
    Ok(ProcessingStatus {
        network: row.try_get::<i64, _>("network")? as u64,
        block_number: row.try_get::<i64, _>("last_processed_block_number")? as u64,
        block_hash: B256::from_str(&hash_text)
            .map_err(|_| StoreError::Corrupt(format!("block hash {hash_text:?}")))?,
    })
}

async fn put_status(
    conn: &mut SqliteConnection,
    network: u64,
    number: BlockNumber,
    hash: B256,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO processing_status (id, network, last_processed_block_number, last_processed_block_hash) \
         VALUES (1, ?1, ?2, ?3) \
         ON CONFLICT (id) DO UPDATE SET network = ?1, last_processed_block_number = ?2, \
         last_processed_block_hash = ?3",
    )
    .bind(network as i64)
    .bind(number as i64)
    .bind(hex(&hash))
    .execute(conn)
    .await?;
    Ok(())
}

async fn latest_row_in(
    conn: &mut SqliteConnection,
    key: &EntityKey,
) -> Result<Option<EntityRecord>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE key = ?1 \
         ORDER BY last_modified_at_block DESC, tx_index DESC, op_index DESC LIMIT 1"
    ))
    .bind(hex(key))
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_record).transpose()
}

async fn insert_entity_row(
    conn: &mut SqliteConnection,
    row: &EntityRow,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO entities (key, expires_at_block, payload, content_type, created_at_block, \
         last_modified_at_block, tx_index, op_index, deleted, owner_address, creator_address) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )
    .bind(hex(&row.key))
    .bind(row.expires_at.min(i64::MAX as u64) as i64)
    .bind(row.compressed_payload.as_slice())
    .bind(&row.content_type)
    .bind(row.created_at as i64)
    .bind(row.coords.block_number as i64)
    .bind(row.coords.tx_index as i64)
    .bind(row.coords.op_index as i64)
    .bind(row.deleted as i64)
    .bind(hex(&row.owner))
    .bind(hex(&row.creator))
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_user_annotations(
    conn: &mut SqliteConnection,
    key: EntityKey,
    coords: VersionCoords,
    strings: &[StringAnnotation],
    numerics: &[NumericAnnotation],
) -> Result<(), StoreError> {
    for annotation in strings {
        sqlx::query(
            "INSERT INTO string_annotations (entity_key, entity_last_modified_at_block, \
             entity_tx_index, entity_op_index, annotation_key, value) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(hex(&key))
        .bind(coords.block_number as i64)
        .bind(coords.tx_index as i64)
        .bind(coords.op_index as i64)
        .bind(&annotation.key)
        .bind(&annotation.value)
        .execute(&mut *conn)
        .await?;
    }
    for annotation in numerics {
        sqlx::query(
            "INSERT INTO numeric_annotations (entity_key, entity_last_modified_at_block, \
             entity_tx_index, entity_op_index, annotation_key, value) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(hex(&key))
        .bind(coords.block_number as i64)
        .bind(coords.tx_index as i64)
        .bind(coords.op_index as i64)
        .bind(&annotation.key)
        // Unsigned in the model, reinterpreted to signed at this boundary.
        .bind(annotation.value as i64)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_synthetic_annotations(
    conn: &mut SqliteConnection,
    key: EntityKey,
    coords: VersionCoords,
    owner: Address,
    creator: Address,
    expires_at: BlockNumber,
) -> Result<(), StoreError> {
    let strings = [
        (SYNTHETIC_KEY, hex(&key)),
        (SYNTHETIC_OWNER, hex(&owner)),
        (SYNTHETIC_CREATOR, hex(&creator)),
    ];
    for (name, value) in strings {
        sqlx::query(
            "INSERT INTO string_annotations (entity_key, entity_last_modified_at_block, \
             entity_tx_index, entity_op_index, annotation_key, value) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(hex(&key))
        .bind(coords.block_number as i64)
        .bind(coords.tx_index as i64)
        .bind(coords.op_index as i64)
        .bind(name)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    }
    let numerics = [
        (SYNTHETIC_EXPIRATION, expires_at),
        (SYNTHETIC_SEQUENCE, coords.sequence()),
    ];
    for (name, value) in numerics {
        sqlx::query(
            "INSERT INTO numeric_annotations (entity_key, entity_last_modified_at_block, \
             entity_tx_index, entity_op_index, annotation_key, value) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(hex(&key))
        .bind(coords.block_number as i64)
        .bind(coords.tx_index as i64)
        .bind(coords.op_index as i64)
        .bind(name)
        .bind(value as i64)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// Copy the prior version's user annotations onto fresh coordinates;
// extend and change-owner preserve annotations but re-stamp them.
async fn restamp_user_annotations(
    conn: &mut SqliteConnection,
    key: EntityKey,
    from: VersionCoords,
    to: VersionCoords,
) -> Result<(), StoreError> {
    for table in ["string_annotations", "numeric_annotations"] {
        sqlx::query(&format!(
            "INSERT INTO {table} (entity_key, entity_last_modified_at_block, entity_tx_index, \
             entity_op_index, annotation_key, value) \
             SELECT entity_key, ?1, ?2, ?3, annotation_key, value FROM {table} \
             WHERE entity_key = ?4 AND entity_last_modified_at_block = ?5 \
             AND entity_tx_index = ?6 AND entity_op_index = ?7 \
             AND substr(annotation_key, 1, 1) != '$'"
        ))
        .bind(to.block_number as i64)
        .bind(to.tx_index as i64)
        .bind(to.op_index as i64)
        .bind(hex(&key))
        .bind(from.block_number as i64)
        .bind(from.tx_index as i64)
        .bind(from.op_index as i64)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn apply_create(
    conn: &mut SqliteConnection,
    create: &CanonicalCreate,
) -> Result<(), StoreError> {
    insert_entity_row(
        conn,
        &EntityRow {
            key: create.key,
            expires_at: create.expires_at,
            compressed_payload: brotli_compress(&create.payload),
            content_type: create.content_type.clone(),
            created_at: create.coords.block_number,
            coords: create.coords,
            deleted: false,
            owner: create.owner,
            creator: create.owner,
        },
    )
    .await?;
    insert_user_annotations(
        conn,
        create.key,
        create.coords,
        &create.string_annotations,
        &create.numeric_annotations,
    )
    .await?;
    insert_synthetic_annotations(
        conn,
        create.key,
        create.coords,
        create.owner,
        create.owner,
        create.expires_at,
    )
    .await
}

async fn apply_update(
    conn: &mut SqliteConnection,
    update: &CanonicalUpdate,
) -> Result<(), StoreError> {
    let previous = latest_row_in(conn, &update.key)
        .await?
        .ok_or(StoreError::MissingPriorVersion(update.key))?;
    insert_entity_row(
        conn,
        &EntityRow {
            key: update.key,
            expires_at: update.expires_at,
            compressed_payload: brotli_compress(&update.payload),
            content_type: update.content_type.clone(),
            created_at: previous.created_at,
            coords: update.coords,
            deleted: false,
            owner: update.owner,
            creator: previous.creator,
        },
    )
    .await?;
    insert_user_annotations(
        conn,
        update.key,
        update.coords,
        &update.string_annotations,
        &update.numeric_annotations,
    )
    .await?;
    insert_synthetic_annotations(
        conn,
        update.key,
        update.coords,
        update.owner,
        previous.creator,
        update.expires_at,
    )
    .await
}

async fn apply_op(conn: &mut SqliteConnection, op: &CanonicalOp) -> Result<(), StoreError> {
    match op {
        CanonicalOp::Create(create) => apply_create(conn, create).await,
        CanonicalOp::Update(update) => apply_update(conn, update).await,
        CanonicalOp::Delete(delete) => {
            let previous = latest_row_in(conn, &delete.key)
                .await?
                .ok_or(StoreError::MissingPriorVersion(delete.key))?;
            // A tombstone row: last in its chain, no annotations.
            insert_entity_row(
                conn,
                &EntityRow {
                    key: delete.key,
                    expires_at: previous.expires_at,
                    compressed_payload: Vec::new(),
                    content_type: previous.content_type,
                    created_at: previous.created_at,
                    coords: delete.coords,
                    deleted: true,
                    owner: previous.owner,
                    creator: previous.creator,
                },
            )
            .await
        }
        CanonicalOp::Extend(extend) => {
            let previous = latest_row_in(conn, &extend.key)
                .await?
                .ok_or(StoreError::MissingPriorVersion(extend.key))?;
            insert_entity_row(
                conn,
                &EntityRow {
                    key: extend.key,
                    expires_at: extend.expires_at,
                    compressed_payload: Vec::new(),
                    content_type: previous.content_type,
                    created_at: previous.created_at,
                    coords: extend.coords,
                    deleted: false,
                    owner: previous.owner,
                    creator: previous.creator,
                },
            )
            .await?;
            copy_payload(conn, &extend.key, previous.coords, extend.coords).await?;
            restamp_user_annotations(conn, extend.key, previous.coords, extend.coords).await?;
            insert_synthetic_annotations(
                conn,
                extend.key,
                extend.coords,
                previous.owner,
                previous.creator,
                extend.expires_at,
            )
            .await
        }
        CanonicalOp::ChangeOwner(change) => {
            let previous = latest_row_in(conn, &change.key)
                .await?
                .ok_or(StoreError::MissingPriorVersion(change.key))?;
            insert_entity_row(
                conn,
                &EntityRow {
                    key: change.key,
                    expires_at: previous.expires_at,
                    compressed_payload: Vec::new(),
                    content_type: previous.content_type,
                    created_at: previous.created_at,
                    coords: change.coords,
                    deleted: false,
                    owner: change.new_owner,
                    creator: previous.creator,
                },
            )
            .await?;
            copy_payload(conn, &change.key, previous.coords, change.coords).await?;
            restamp_user_annotations(conn, change.key, previous.coords, change.coords).await?;
            insert_synthetic_annotations(
                conn,
                change.key,
                change.coords,
                change.new_owner,
                previous.creator,
                previous.expires_at,
            )
            .await
        }
    }
}

// Extend and change-owner carry no payload of their own; the new version
// row inherits the stored (still compressed) payload of the previous one.
async fn copy_payload(
    conn: &mut SqliteConnection,
    key: &EntityKey,
    from: VersionCoords,
    to: VersionCoords,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE entities SET payload = (SELECT payload FROM entities \
         WHERE key = ?1 AND last_modified_at_block = ?2 AND tx_index = ?3 AND op_index = ?4) \
         WHERE key = ?1 AND last_modified_at_block = ?5 AND tx_index = ?6 AND op_index = ?7",
    )
    .bind(hex(key))
    .bind(from.block_number as i64)
    .bind(from.tx_index as i64)
    .bind(from.op_index as i64)
    .bind(to.block_number as i64)
    .bind(to.tx_index as i64)
    .bind(to.op_index as i64)
    .execute(conn)
    .await?;
    Ok(())
}

async fn ensure_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_versions ( \
         id INTEGER PRIMARY KEY CHECK (id = 1), \
         entities_version INTEGER NOT NULL)",
    )
    .execute(&mut *tx)
    .await?;

    let stored: Option<i64> =
        sqlx::query_scalar("SELECT entities_version FROM schema_versions WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await?;

    match stored {
        None => {
            sqlx::query("INSERT INTO schema_versions (id, entities_version) VALUES (1, ?1)")
                .bind(ENTITIES_SCHEMA_VERSION)
                .execute(&mut *tx)
                .await?;
        }
        Some(version) if version == ENTITIES_SCHEMA_VERSION => {}
        Some(version) => {
            // Incompatible layout on disk: drop the data tables and let the
            // ingester snap-sync the content back in.
            warn!(
                stored = version,
                expected = ENTITIES_SCHEMA_VERSION,
                "entities schema version mismatch, recreating data tables"
            );
            for table in ["string_annotations", "numeric_annotations", "entities"] {
                sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM processing_status")
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE schema_versions SET entities_version = ?1 WHERE id = 1")
                .bind(ENTITIES_SCHEMA_VERSION)
                .execute(&mut *tx)
                .await?;
        }
    }

    for statement in [
        "CREATE TABLE IF NOT EXISTS entities ( \
         key TEXT NOT NULL, \
         expires_at_block INTEGER NOT NULL, \
         payload BLOB NOT NULL, \
         content_type TEXT, \
         created_at_block INTEGER NOT NULL, \
         last_modified_at_block INTEGER NOT NULL, \
         tx_index INTEGER NOT NULL, \
         op_index INTEGER NOT NULL, \
         deleted INTEGER NOT NULL DEFAULT 0, \
         owner_address TEXT NOT NULL, \
         creator_address TEXT NOT NULL, \
         PRIMARY KEY (key, last_modified_at_block, tx_index, op_index))",
        "CREATE INDEX IF NOT EXISTS entities_owner ON entities (owner_address)",
        "CREATE INDEX IF NOT EXISTS entities_last_modified ON entities (last_modified_at_block)",
        "CREATE TABLE IF NOT EXISTS string_annotations ( \
         entity_key TEXT NOT NULL, \
         entity_last_modified_at_block INTEGER NOT NULL, \
         entity_tx_index INTEGER NOT NULL, \
         entity_op_index INTEGER NOT NULL, \
         annotation_key TEXT NOT NULL, \
         value TEXT NOT NULL, \
         PRIMARY KEY (entity_key, entity_last_modified_at_block, entity_tx_index, \
         entity_op_index, annotation_key, value), \
         FOREIGN KEY (entity_key, entity_last_modified_at_block, entity_tx_index, entity_op_index) \
         REFERENCES entities (key, last_modified_at_block, tx_index, op_index) ON DELETE CASCADE)",
        "CREATE INDEX IF NOT EXISTS string_annotations_last_modified \
         ON string_annotations (entity_last_modified_at_block)",
        "CREATE INDEX IF NOT EXISTS string_annotations_version_key \
         ON string_annotations (entity_key, entity_last_modified_at_block, entity_tx_index, \
         entity_op_index, annotation_key)",
        "CREATE TABLE IF NOT EXISTS numeric_annotations ( \
         entity_key TEXT NOT NULL, \
         entity_last_modified_at_block INTEGER NOT NULL, \
         entity_tx_index INTEGER NOT NULL, \
         entity_op_index INTEGER NOT NULL, \
         annotation_key TEXT NOT NULL, \
         value INTEGER NOT NULL, \
         PRIMARY KEY (entity_key, entity_last_modified_at_block, entity_tx_index, \
         entity_op_index, annotation_key, value), \
         FOREIGN KEY (entity_key, entity_last_modified_at_block, entity_tx_index, entity_op_index) \
         REFERENCES entities (key, last_modified_at_block, tx_index, op_index) ON DELETE CASCADE)",
        "CREATE INDEX IF NOT EXISTS numeric_annotations_last_modified \
         ON numeric_annotations (entity_last_modified_at_block)",
        "CREATE INDEX IF NOT EXISTS numeric_annotations_version_key \
         ON numeric_annotations (entity_key, entity_last_modified_at_block, entity_tx_index, \
         entity_op_index, annotation_key)",
        "CREATE TABLE IF NOT EXISTS processing_status ( \
         id INTEGER PRIMARY KEY CHECK (id = 1), \
         network INTEGER NOT NULL, \
         last_processed_block_number INTEGER NOT NULL, \
         last_processed_block_hash TEXT NOT NULL)",
    ] {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CanonicalDelete;
    use alloy_primitives::{address, b256};

    fn temp_store_path(dir: &tempfile::TempDir) -> String {
        dir.path().join("arkiv.db").to_string_lossy().into_owned()
    }

    fn create_op(key: B256, block: BlockNumber, op_index: u64) -> CanonicalOp {
        CanonicalOp::Create(CanonicalCreate {
            key,
            payload: Bytes::from_static(b"test payload"),
            content_type: "text/plain".into(),
            owner: address!("00000000000000000000000000000000000000a1"),
            expires_at: block + 100,
            coords: VersionCoords::new(block, 0, op_index),
            string_annotations: vec![Annotation::new("test_key", "test_value".to_owned())],
            numeric_annotations: vec![Annotation::new("test_number", 42u64)],
        })
    }

    fn record(number: BlockNumber, parent: B256, ops: Vec<CanonicalOp>) -> BlockRecord {
        BlockRecord {
            chain_id: 1337,
            number,
            hash: B256::repeat_byte(number as u8),
            parent_hash: parent,
            timestamp: 1_700_000_000 + number,
            ops,
        }
    }

    #[tokio::test]
    async fn apply_then_point_in_time_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&temp_store_path(&dir)).await.unwrap();
        let key = b256!("00000000000000000000000000000000000000000000000000000000000000aa");

        store
            .apply_block(&record(1, B256::ZERO, vec![create_op(key, 1, 0)]))
            .await
            .unwrap();
        store
            .apply_block(&record(
                2,
                B256::repeat_byte(1),
                vec![CanonicalOp::Update(CanonicalUpdate {
                    key,
                    payload: Bytes::from_static(b"new payload"),
                    content_type: "text/plain".into(),
                    owner: address!("00000000000000000000000000000000000000a1"),
                    expires_at: 102,
                    coords: VersionCoords::new(2, 0, 0),
                    string_annotations: Vec::new(),
                    numeric_annotations: Vec::new(),
                })],
            ))
            .await
            .unwrap();

        let at_1 = store.latest_version(&key, Some(1)).await.unwrap().unwrap();
        assert_eq!(at_1.payload.as_ref(), b"test payload");
        assert_eq!(at_1.string_annotations.len(), 1);
        let at_2 = store.latest_version(&key, Some(2)).await.unwrap().unwrap();
        assert_eq!(at_2.payload.as_ref(), b"new payload");
        assert_eq!(at_2.created_at, 1);
        assert_eq!(store.entity_count(Some(2)).await.unwrap(), 1);

        let status = store.processing_status().await.unwrap().unwrap();
        assert_eq!(status.block_number, 2);
        assert_eq!(status.network, 1337);
    }

    #[tokio::test]
    async fn continuity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&temp_store_path(&dir)).await.unwrap();

        // First block must be 1.
        let err = store
            .apply_block(&record(5, B256::repeat_byte(4), Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Continuity { number: 5 }));

        store
            .apply_block(&record(1, B256::ZERO, Vec::new()))
            .await
            .unwrap();
        // Parent hash must match the recorded status hash.
        let err = store
            .apply_block(&record(2, B256::repeat_byte(9), Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Continuity { number: 2 }));

        // A different chain id is rejected outright.
        let mut foreign = record(2, B256::repeat_byte(1), Vec::new());
        foreign.chain_id = 1;
        assert!(matches!(
            store.apply_block(&foreign).await.unwrap_err(),
            StoreError::NetworkMismatch { bound: 1337, got: 1 }
        ));
    }

    #[tokio::test]
    async fn tombstone_hides_the_entity_from_that_block_on() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&temp_store_path(&dir)).await.unwrap();
        let key = b256!("00000000000000000000000000000000000000000000000000000000000000bb");

        store
            .apply_block(&record(1, B256::ZERO, vec![create_op(key, 1, 0)]))
            .await
            .unwrap();
        store
            .apply_block(&record(
                2,
                B256::repeat_byte(1),
                vec![CanonicalOp::Delete(CanonicalDelete {
                    key,
                    coords: VersionCoords::new(2, 0, 0),
                    expired: true,
                })],
            ))
            .await
            .unwrap();

        assert_eq!(store.entity_count(Some(1)).await.unwrap(), 1);
        assert_eq!(store.entity_count(Some(2)).await.unwrap(), 0);
        let at_2 = store.latest_version(&key, Some(2)).await.unwrap().unwrap();
        assert!(at_2.deleted);
        // The pre-delete state is still readable.
        let at_1 = store.latest_version(&key, Some(1)).await.unwrap().unwrap();
        assert!(!at_1.deleted);
    }

    #[tokio::test]
    async fn garbage_collection_keeps_resolvable_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&temp_store_path(&dir)).await.unwrap();
        let key = b256!("00000000000000000000000000000000000000000000000000000000000000cc");

        store
            .apply_block(&record(1, B256::ZERO, vec![create_op(key, 1, 0)]))
            .await
            .unwrap();
        let mut parent = B256::repeat_byte(1);
        for number in 2..=12u64 {
            let ops = if number == 2 {
                vec![CanonicalOp::Update(CanonicalUpdate {
                    key,
                    payload: Bytes::from_static(b"new payload"),
                    content_type: "text/plain".into(),
                    owner: address!("00000000000000000000000000000000000000a1"),
                    expires_at: 200,
                    coords: VersionCoords::new(2, 0, 0),
                    string_annotations: Vec::new(),
                    numeric_annotations: Vec::new(),
                })]
            } else {
                Vec::new()
            };
            store.apply_block(&record(number, parent, ops)).await.unwrap();
            parent = B256::repeat_byte(number as u8);
        }

        // Retention 5 at head 12: the superseded block-1 row is garbage,
        // the live block-2 row must survive.
        let removed = store.collect_garbage(5, 1).await.unwrap();
        assert_eq!(removed, 1);
        let latest = store.latest_version(&key, Some(12)).await.unwrap().unwrap();
        assert_eq!(latest.coords.block_number, 2);
        assert_eq!(store.latest_version(&key, Some(1)).await.unwrap(), None);

        // Retention 0 collects nothing.
        assert_eq!(store.collect_garbage(0, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn snap_sync_replaces_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&temp_store_path(&dir)).await.unwrap();
        let stale = b256!("00000000000000000000000000000000000000000000000000000000000000dd");
        store
            .apply_block(&record(1, B256::ZERO, vec![create_op(stale, 1, 0)]))
            .await
            .unwrap();

        let fresh = b256!("00000000000000000000000000000000000000000000000000000000000000ee");
        store
            .snap_sync(
                1337,
                7,
                B256::repeat_byte(7),
                &[SnapshotEntity {
                    key: fresh,
                    compressed_payload: brotli_compress(b"snapshot payload").into(),
                    content_type: "text/plain".into(),
                    owner: address!("00000000000000000000000000000000000000a1"),
                    creator: address!("00000000000000000000000000000000000000a1"),
                    expires_at: 100,
                    created_at: 3,
                    coords: VersionCoords::new(5, 1, 2),
                    string_annotations: vec![Annotation::new("kept", "yes".to_owned())],
                    numeric_annotations: Vec::new(),
                }],
            )
            .await
            .unwrap();

        assert_eq!(store.latest_version(&stale, None).await.unwrap(), None);
        let record = store.latest_version(&fresh, None).await.unwrap().unwrap();
        assert_eq!(record.payload.as_ref(), b"snapshot payload");
        assert_eq!(record.string_annotations.len(), 1);
        let status = store.processing_status().await.unwrap().unwrap();
        assert_eq!(status.block_number, 7);
    }

    #[tokio::test]
    async fn used_slots_counts_live_rows_and_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&temp_store_path(&dir)).await.unwrap();
        let key = b256!("00000000000000000000000000000000000000000000000000000000000000af");
        store
            .apply_block(&record(1, B256::ZERO, vec![create_op(key, 1, 0)]))
            .await
            .unwrap();
        // 1 entity row + 2 user annotations + 5 synthetic annotations.
        assert_eq!(store.used_slots().await.unwrap(), 8);
    }
}
