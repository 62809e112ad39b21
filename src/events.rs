//! Event logs emitted by the Arkiv processor.
//!
//! Topic 0 is the keccak256 of the canonical signature string; topic 1 is
//! always the entity key; owner addresses ride in the remaining topics,
//! left-padded to 32 bytes. Expiration heights (and a cost field the core
//! always writes as zero) are packed into the data section as 32-byte
//! big-endian words.

use std::sync::OnceLock;

use alloy_primitives::{keccak256, Address, Bytes, Log, LogData, B256, U256};

use crate::{ARKIV_ADDRESS, BlockNumber, EntityKey};

/// Errors decoding a log that carries a known Arkiv signature.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The log has fewer topics than its signature requires.
    #[error("arkiv log {signature} has {got} topics, expected {expected}")]
    MissingTopics {
        /// Event name.
        signature: &'static str,
        /// Topics present.
        got: usize,
        /// Topics required.
        expected: usize,
    },
    /// The data section is not the expected number of 32-byte words.
    #[error("arkiv log {signature} has {got} data bytes, expected {expected}")]
    BadDataLength {
        /// Event name.
        signature: &'static str,
        /// Bytes present.
        got: usize,
        /// Bytes required.
        expected: usize,
    },
    /// A word does not fit the u64 it encodes.
    #[error("arkiv log {signature}: word {index} out of u64 range")]
    WordOutOfRange {
        /// Event name.
        signature: &'static str,
        /// Word position within the data section.
        index: usize,
    },
}

fn signature(cache: &'static OnceLock<B256>, preimage: &'static str) -> B256 {
    *cache.get_or_init(|| keccak256(preimage.as_bytes()))
}

/// Topic 0 of `ArkivEntityCreated(uint256,address,uint256,uint256)`.
pub(crate) fn created_signature() -> B256 {
    static SIG: OnceLock<B256> = OnceLock::new();
    signature(&SIG, "ArkivEntityCreated(uint256,address,uint256,uint256)")
}

/// Topic 0 of `ArkivEntityUpdated(uint256,address,uint256,uint256,uint256)`.
pub(crate) fn updated_signature() -> B256 {
    static SIG: OnceLock<B256> = OnceLock::new();
    signature(
        &SIG,
        "ArkivEntityUpdated(uint256,address,uint256,uint256,uint256)",
    )
}

/// Topic 0 of `ArkivEntityDeleted(uint256,address)`.
pub(crate) fn deleted_signature() -> B256 {
    static SIG: OnceLock<B256> = OnceLock::new();
    signature(&SIG, "ArkivEntityDeleted(uint256,address)")
}

/// Topic 0 of `ArkivEntityExpired(uint256,address)`.
pub(crate) fn expired_signature() -> B256 {
    static SIG: OnceLock<B256> = OnceLock::new();
    signature(&SIG, "ArkivEntityExpired(uint256,address)")
}

/// Topic 0 of `ArkivEntityBTLExtended(uint256,address,uint256,uint256,uint256)`.
pub(crate) fn extended_signature() -> B256 {
    static SIG: OnceLock<B256> = OnceLock::new();
    signature(
        &SIG,
        "ArkivEntityBTLExtended(uint256,address,uint256,uint256,uint256)",
    )
}

/// Topic 0 of `ArkivEntityOwnerChanged(uint256,address,address)`.
pub(crate) fn owner_changed_signature() -> B256 {
    static SIG: OnceLock<B256> = OnceLock::new();
    signature(&SIG, "ArkivEntityOwnerChanged(uint256,address,address)")
}

/// A decoded Arkiv event log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArkivEvent {
    /// A new entity came into existence.
    Created {
        /// Entity key.
        key: EntityKey,
        /// Owner (and creator) of the new entity.
        owner: Address,
        /// Absolute expiration block.
        expires_at: BlockNumber,
    },
    /// An existing entity was replaced with new content.
    Updated {
        /// Entity key.
        key: EntityKey,
        /// Owner at the time of the update.
        owner: Address,
        /// Expiration before the update.
        old_expires_at: BlockNumber,
        /// Expiration after the update.
        new_expires_at: BlockNumber,
    },
    /// An entity was deleted by its owner.
    Deleted {
        /// Entity key.
        key: EntityKey,
        /// Owner at the time of the delete.
        owner: Address,
    },
    /// An entity reached its expiration block and was reaped by
    /// housekeeping.
    Expired {
        /// Entity key.
        key: EntityKey,
        /// Owner at the time of expiration.
        owner: Address,
    },
    /// An entity's lifetime was extended.
    Extended {
        /// Entity key.
        key: EntityKey,
        /// Owner at the time of the extension.
        owner: Address,
        /// Expiration before the extension.
        old_expires_at: BlockNumber,
        /// Expiration after the extension.
        new_expires_at: BlockNumber,
    },
    /// An entity changed owners.
    OwnerChanged {
        /// Entity key.
        key: EntityKey,
        /// Owner before the transfer.
        old_owner: Address,
        /// Owner after the transfer.
        new_owner: Address,
    },
}

impl ArkivEvent {
    /// Render this event as the receipt log the processor emits.
    pub fn to_log(&self) -> Log {
        let (topics, data) = match self {
            Self::Created {
                key,
                owner,
                expires_at,
            } => (
                vec![created_signature(), *key, address_topic(owner)],
                words(&[*expires_at, 0]),
            ),
            Self::Updated {
                key,
                owner,
                old_expires_at,
                new_expires_at,
            } => (
                vec![updated_signature(), *key, address_topic(owner)],
                words(&[*old_expires_at, *new_expires_at, 0]),
            ),
            Self::Deleted { key, owner } => (
                vec![deleted_signature(), *key, address_topic(owner)],
                Bytes::new(),
            ),
            Self::Expired { key, owner } => (
                vec![expired_signature(), *key, address_topic(owner)],
                Bytes::new(),
            ),
            Self::Extended {
                key,
                owner,
                old_expires_at,
                new_expires_at,
            } => (
                vec![extended_signature(), *key, address_topic(owner)],
                words(&[*old_expires_at, *new_expires_at, 0]),
            ),
            Self::OwnerChanged {
                key,
                old_owner,
                new_owner,
            } => (
                vec![
                    owner_changed_signature(),
                    *key,
                    address_topic(old_owner),
                    address_topic(new_owner),
                ],
                Bytes::new(),
            ),
        };
        Log {
            address: ARKIV_ADDRESS,
            data: LogData::new_unchecked(topics, data),
        }
    }
}

fn address_topic(address: &Address) -> B256 {
    B256::left_padding_from(address.as_slice())
}

fn topic_address(topic: &B256) -> Address {
    Address::from_slice(&topic[12..])
}

fn words(values: &[u64]) -> Bytes {
    let mut out = Vec::with_capacity(values.len() * 32);
    for value in values {
        out.extend_from_slice(B256::from(U256::from(*value)).as_slice());
    }
    out.into()
}

fn word_u64(signature: &'static str, data: &[u8], index: usize) -> Result<u64, EventError> {
    let word = U256::from_be_slice(&data[index * 32..(index + 1) * 32]);
    u64::try_from(word).map_err(|_| EventError::WordOutOfRange { signature, index })
}

fn check(
    signature: &'static str,
    topics: &[B256],
    expected_topics: usize,
    data: &[u8],
    expected_data: usize,
) -> Result<(), EventError> {
    if topics.len() < expected_topics {
        return Err(EventError::MissingTopics {
            signature,
            got: topics.len(),
            expected: expected_topics,
        });
    }
    if data.len() != expected_data {
        return Err(EventError::BadDataLength {
            signature,
            got: data.len(),
            expected: expected_data,
        });
    }
    Ok(())
}

/// Decode a receipt log. `Ok(None)` means the log is not an Arkiv event
/// (wrong emitter or unknown topic 0); a malformed log under a known
/// signature is an error.
pub fn decode_arkiv_log(log: &Log) -> Result<Option<ArkivEvent>, EventError> {
    if log.address != ARKIV_ADDRESS {
        return Ok(None);
    }
    let topics = log.data.topics();
    let data: &[u8] = &log.data.data;
    let Some(topic0) = topics.first() else {
        return Ok(None);
    };

    let event = if *topic0 == created_signature() {
        check("ArkivEntityCreated", topics, 3, data, 64)?;
        ArkivEvent::Created {
            key: topics[1],
            owner: topic_address(&topics[2]),
            expires_at: word_u64("ArkivEntityCreated", data, 0)?,
        }
    } else if *topic0 == updated_signature() {
        check("ArkivEntityUpdated", topics, 3, data, 96)?;
        ArkivEvent::Updated {
            key: topics[1],
            owner: topic_address(&topics[2]),
            old_expires_at: word_u64("ArkivEntityUpdated", data, 0)?,
            new_expires_at: word_u64("ArkivEntityUpdated", data, 1)?,
        }
    } else if *topic0 == deleted_signature() {
        check("ArkivEntityDeleted", topics, 3, data, 0)?;
        ArkivEvent::Deleted {
            key: topics[1],
            owner: topic_address(&topics[2]),
        }
    } else if *topic0 == expired_signature() {
        check("ArkivEntityExpired", topics, 3, data, 0)?;
        ArkivEvent::Expired {
            key: topics[1],
            owner: topic_address(&topics[2]),
        }
    } else if *topic0 == extended_signature() {
        check("ArkivEntityBTLExtended", topics, 3, data, 96)?;
        ArkivEvent::Extended {
            key: topics[1],
            owner: topic_address(&topics[2]),
            old_expires_at: word_u64("ArkivEntityBTLExtended", data, 0)?,
            new_expires_at: word_u64("ArkivEntityBTLExtended", data, 1)?,
        }
    } else if *topic0 == owner_changed_signature() {
        check("ArkivEntityOwnerChanged", topics, 4, data, 0)?;
        ArkivEvent::OwnerChanged {
            key: topics[1],
            old_owner: topic_address(&topics[2]),
            new_owner: topic_address(&topics[3]),
        }
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}
