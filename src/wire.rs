//! Wire format of Arkiv-addressed transactions.
//!
//! The transaction `data` field is a brotli-compressed, RLP-encoded record
//! of five parallel operation lists. Decompression is capped hard: a
//! hostile transaction must not be able to balloon past
//! [`MAX_DECOMPRESSED_BYTES`](crate::MAX_DECOMPRESSED_BYTES) in memory.

use std::io::Read;

use alloy_primitives::{Address, Bytes, B256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};

use crate::MAX_DECOMPRESSED_BYTES;

// Window and quality brotli parameters for payload-at-rest compression.
// Quality 5 keeps ingest cheap; the format does not pin these, only the
// decoder matters for consensus of the mirror.
const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;

/// Errors decoding a transaction's data field.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The brotli stream is malformed.
    #[error("brotli decompression failed: {0}")]
    Brotli(String),
    /// The decompressed size exceeds the configured ceiling.
    #[error("decompression cap exceeded")]
    DecompressionCapExceeded,
    /// The decompressed bytes are not a valid RLP record.
    #[error("rlp decoding failed: {0}")]
    Rlp(#[from] alloy_rlp::Error),
}

/// One string annotation on the wire.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct WireStringAnnotation {
    /// Annotation name.
    pub key: String,
    /// Annotation value.
    pub value: String,
}

/// One numeric annotation on the wire.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct WireNumericAnnotation {
    /// Annotation name.
    pub key: String,
    /// Annotation value.
    pub value: u64,
}

/// A create operation as declared in the batch.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct WireCreate {
    /// Blocks-to-live; added to the containing block number to compute the
    /// expiration height. Must be non-zero.
    pub btl: u64,
    /// Content type; non-empty, at most 128 bytes.
    pub content_type: String,
    /// Payload bytes.
    pub payload: Bytes,
    /// String annotations attached to the new entity.
    pub string_annotations: Vec<WireStringAnnotation>,
    /// Numeric annotations attached to the new entity.
    pub numeric_annotations: Vec<WireNumericAnnotation>,
}

/// An update operation: payload, content type, expiration, and annotations
/// are all replaced; owner and creator are preserved.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct WireUpdate {
    /// Target entity.
    pub entity_key: B256,
    /// New blocks-to-live. Must be non-zero.
    pub btl: u64,
    /// New content type.
    pub content_type: String,
    /// New payload.
    pub payload: Bytes,
    /// Replacement string annotations.
    pub string_annotations: Vec<WireStringAnnotation>,
    /// Replacement numeric annotations.
    pub numeric_annotations: Vec<WireNumericAnnotation>,
}

/// An extend-lifetime operation.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct WireExtend {
    /// Target entity.
    pub entity_key: B256,
    /// Blocks to add to the current expiration. Must be non-zero.
    pub number_of_blocks: u64,
}

/// A change-owner operation.
#[derive(Clone, Debug, PartialEq, Eq, RlpDecodable, RlpEncodable)]
pub struct WireChangeOwner {
    /// Target entity.
    pub entity_key: B256,
    /// The owner after this operation.
    pub new_owner: Address,
}

/// A decoded mutation batch: five parallel operation lists. Execution
/// order is creates, deletes, updates, extends, change-owners; each
/// operation retains its declared index within its list.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ArkivTransaction {
    /// Entities to create.
    pub creates: Vec<WireCreate>,
    /// Entities to update.
    pub updates: Vec<WireUpdate>,
    /// Keys of entities to delete.
    pub deletes: Vec<B256>,
    /// Lifetime extensions.
    pub extends: Vec<WireExtend>,
    /// Ownership transfers.
    pub change_owners: Vec<WireChangeOwner>,
}

impl ArkivTransaction {
    /// Whether the batch carries no operations at all.
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.extends.is_empty()
            && self.change_owners.is_empty()
    }
}

/// Decode a transaction's `data` field: brotli-decompress under the global
/// ceiling, then RLP-decode the batch record.
pub fn decode_transaction_input(input: &[u8]) -> Result<ArkivTransaction, WireError> {
    let raw = brotli_decompress(input, MAX_DECOMPRESSED_BYTES)?;
    Ok(ArkivTransaction::decode(&mut raw.as_slice())?)
}

/// Encode a batch into the on-the-wire `data` field. The inverse of
/// [`decode_transaction_input`]; the indexer itself never sends
/// transactions, but harnesses and tests do.
pub fn encode_transaction_input(tx: &ArkivTransaction) -> Bytes {
    brotli_compress(&alloy_rlp::encode(tx)).into()
}

/// Brotli-compress `data`. Used for the transaction wire format and for
/// payload bytes at rest.
pub fn brotli_compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut writer =
            brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LGWIN);
        // Writing to a Vec cannot fail.
        std::io::Write::write_all(&mut writer, data).unwrap_or_default();
    }
    out
}

/// Brotli-decompress `data`, failing once the output would exceed `cap`.
pub fn brotli_decompress(data: &[u8], cap: usize) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    let mut reader = brotli::Decompressor::new(data, BROTLI_BUFFER).take(cap as u64 + 1);
    reader
        .read_to_end(&mut out)
        .map_err(|err| WireError::Brotli(err.to_string()))?;
    if out.len() > cap {
        return Err(WireError::DecompressionCapExceeded);
    }
    Ok(out)
}
