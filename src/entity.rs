//! Core data model: entity version rows, annotations, version coordinates.
//!
//! Every mutation inserts a new version row keyed on
//! `(key, last_modified_at_block, tx_index, op_index)` instead of updating
//! in place, which is what makes point-in-time reads possible.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

use crate::{BlockNumber, OpIndex, TxIndex};

/// 32-byte entity identifier, derived at creation time from
/// `keccak256(tx_hash ∥ payload ∥ left_pad_32(op_index))` and stable
/// for the entity's whole life.
pub type EntityKey = B256;

/// Reserved string annotation holding the entity key as lowercase hex.
pub const SYNTHETIC_KEY: &str = "$key";
/// Reserved string annotation holding the current owner as lowercase hex.
pub const SYNTHETIC_OWNER: &str = "$owner";
/// Reserved string annotation holding the creator as lowercase hex.
pub const SYNTHETIC_CREATOR: &str = "$creator";
/// Reserved numeric annotation holding the absolute expiration block.
pub const SYNTHETIC_EXPIRATION: &str = "$expiration";
/// Reserved numeric annotation holding the packed modification sequence,
/// monotone over an entity's life. See [`VersionCoords::sequence`].
pub const SYNTHETIC_SEQUENCE: &str = "$sequence";

/// The five reserved annotation names the query language accepts.
pub(crate) const SYNTHETIC_NAMES: [&str; 5] = [
    SYNTHETIC_KEY,
    SYNTHETIC_OWNER,
    SYNTHETIC_CREATOR,
    SYNTHETIC_EXPIRATION,
    SYNTHETIC_SEQUENCE,
];

/// Position of one mutation inside the chain: block, then transaction
/// within the block, then operation within the transaction. The derived
/// lexicographic order is exactly modification order, so "latest version"
/// everywhere means "maximum coordinates".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VersionCoords {
    /// Block the mutation landed in.
    pub block_number: BlockNumber,
    /// Transaction index within that block.
    pub tx_index: TxIndex,
    /// Operation index within that transaction.
    pub op_index: OpIndex,
}

impl VersionCoords {
    /// Coordinates of an operation at `(block, tx, op)`.
    pub fn new(block_number: BlockNumber, tx_index: TxIndex, op_index: OpIndex) -> Self {
        Self {
            block_number,
            tx_index,
            op_index,
        }
    }

    /// The `$sequence` value: `(block << 32) | (tx_index << 16) | op_index`.
    pub fn sequence(&self) -> u64 {
        (self.block_number << 32) | ((self.tx_index & 0xffff) << 16) | (self.op_index & 0xffff)
    }
}

impl std::fmt::Display for VersionCoords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.block_number, self.tx_index, self.op_index
        )
    }
}

/// Full version identifier of one row: key plus coordinates. This is the
/// value tables join on and cursors resume from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId {
    /// Entity key.
    pub key: EntityKey,
    /// Modification coordinates.
    pub coords: VersionCoords,
}

/// A typed key-value pair attached to one entity version. The two type
/// families (string and numeric) are disjoint: the same key may appear in
/// both families on one entity, but not twice within one family on one
/// version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Annotation<V> {
    /// Annotation name. User names match the identifier pattern; names
    /// starting with `$` are reserved for the system.
    pub key: String,
    /// Annotation value.
    pub value: V,
}

impl<V> Annotation<V> {
    /// Annotation `key = value`.
    pub fn new(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// String-valued annotation.
pub type StringAnnotation = Annotation<String>;
/// Numeric annotation; unsigned 64-bit in the model, reinterpreted to
/// signed 64-bit at the SQLite boundary.
pub type NumericAnnotation = Annotation<u64>;

/// Whether `key` is acceptable as a user annotation name: a letter or
/// underscore followed by letters, digits, or underscores. Unicode letters
/// are permitted. Reserved `$` names never pass.
pub fn is_valid_annotation_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// One entity version row, fully hydrated. This is what the executor reads
/// through its state view and what point-in-time lookups return; `deleted`
/// marks a tombstone.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityRecord {
    /// Entity key.
    pub key: EntityKey,
    /// Raw (decompressed) payload bytes.
    pub payload: Bytes,
    /// Content type; non-empty on write, defaulted on historic reads.
    pub content_type: String,
    /// Current owner.
    pub owner: Address,
    /// Creator; never changes after the create.
    pub creator: Address,
    /// Absolute block height at which the entity expires.
    pub expires_at: BlockNumber,
    /// Block the entity was created in.
    pub created_at: BlockNumber,
    /// Coordinates of this version.
    pub coords: VersionCoords,
    /// Tombstone flag; a deleted version is the last in its chain.
    pub deleted: bool,
    /// User string annotations of this version.
    pub string_annotations: Vec<StringAnnotation>,
    /// User numeric annotations of this version.
    pub numeric_annotations: Vec<NumericAnnotation>,
}

impl EntityRecord {
    /// The synthetic string annotations materialised for this version:
    /// `$key`, `$owner`, `$creator`.
    pub fn synthetic_strings(&self) -> Vec<StringAnnotation> {
        vec![
            Annotation::new(SYNTHETIC_KEY, format!("{:#x}", self.key)),
            Annotation::new(SYNTHETIC_OWNER, format!("{:#x}", self.owner)),
            Annotation::new(SYNTHETIC_CREATOR, format!("{:#x}", self.creator)),
        ]
    }

    /// The synthetic numeric annotations materialised for this version:
    /// `$expiration`, `$sequence`.
    pub fn synthetic_numerics(&self) -> Vec<NumericAnnotation> {
        vec![
            Annotation::new(SYNTHETIC_EXPIRATION, self.expires_at),
            Annotation::new(SYNTHETIC_SEQUENCE, self.coords.sequence()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coords_order_is_modification_order() {
        let a = VersionCoords::new(1, 0, 5);
        let b = VersionCoords::new(1, 1, 0);
        let c = VersionCoords::new(2, 0, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn sequence_packs_and_advances() {
        let v1 = VersionCoords::new(1, 0, 0);
        let v2 = VersionCoords::new(1, 0, 1);
        let v3 = VersionCoords::new(2, 3, 4);
        assert_eq!(v1.sequence(), 1 << 32);
        assert!(v1.sequence() < v2.sequence());
        assert_eq!(v3.sequence(), (2 << 32) | (3 << 16) | 4);
    }

    #[test]
    fn annotation_key_pattern() {
        assert!(is_valid_annotation_key("test_key"));
        assert!(is_valid_annotation_key("_x9"));
        assert!(is_valid_annotation_key("schlüssel"));
        assert!(!is_valid_annotation_key("123invalid"));
        assert!(!is_valid_annotation_key("foo@bar"));
        assert!(!is_valid_annotation_key("$anything"));
        assert!(!is_valid_annotation_key(""));
    }
}
