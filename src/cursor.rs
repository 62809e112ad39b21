//! Pagination cursors.
//!
//! A cursor is an opaque lowercase-hex token over a small length-prefixed
//! binary record: the at-block the page was served at, plus the ordering
//! column values of the last row the caller received. Carrying the column
//! names keeps old cursors meaningful when new order columns appear;
//! carrying the at-block pins repeated requests to one snapshot.

use alloy_primitives::hex;

use crate::{plan::OrderSpec, BlockNumber};

const CURSOR_VERSION: u8 = 1;

/// Errors decoding or validating a cursor token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    /// Not a hex string.
    #[error("cursor is not valid hex")]
    Hex,
    /// Too short, or an inner length prefix runs past the end.
    #[error("cursor is truncated or malformed")]
    Malformed,
    /// Encoded with a version this build does not understand.
    #[error("unsupported cursor version {0}")]
    Version(u8),
    /// References a column the request's ordering does not contain.
    #[error("cursor references unknown column {0:?}")]
    UnknownColumn(String),
    /// Columns are known but do not line up with the requested ordering.
    #[error("cursor does not match the requested ordering")]
    OrderMismatch,
}

/// One ordering column position inside a cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorColumn {
    /// Column name (an entity column or an order-by annotation).
    pub name: String,
    /// Value of the last returned row in this column.
    pub value: CursorValue,
    /// Whether the column is ordered descending.
    pub descending: bool,
}

/// A typed cursor value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorValue {
    /// Numeric column value.
    Num(u64),
    /// Text column value.
    Text(String),
}

/// A decoded cursor: resume-after position at a pinned block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    /// Snapshot block the page sequence is served at.
    pub at_block: BlockNumber,
    /// Ordering tuple of the last row already delivered.
    pub positions: Vec<CursorColumn>,
}

impl Cursor {
    /// Render the opaque token.
    pub fn encode(&self) -> String {
        let mut out = Vec::new();
        out.push(CURSOR_VERSION);
        out.extend_from_slice(&self.at_block.to_be_bytes());
        out.extend_from_slice(&(self.positions.len() as u16).to_be_bytes());
        for column in &self.positions {
            out.extend_from_slice(&(column.name.len() as u16).to_be_bytes());
            out.extend_from_slice(column.name.as_bytes());
            out.push(column.descending as u8);
            match &column.value {
                CursorValue::Num(value) => {
                    out.push(0);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                CursorValue::Text(value) => {
                    out.push(1);
                    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                    out.extend_from_slice(value.as_bytes());
                }
            }
        }
        hex::encode(out)
    }

    /// Decode a token produced by [`Cursor::encode`].
    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let bytes = hex::decode(token).map_err(|_| CursorError::Hex)?;
        let mut reader = Reader {
            bytes: &bytes,
            pos: 0,
        };
        let version = reader.u8()?;
        if version != CURSOR_VERSION {
            return Err(CursorError::Version(version));
        }
        let at_block = reader.u64()?;
        let count = reader.u16()? as usize;
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            let name_len = reader.u16()? as usize;
            let name = String::from_utf8(reader.take(name_len)?.to_vec())
                .map_err(|_| CursorError::Malformed)?;
            let descending = reader.u8()? != 0;
            let value = match reader.u8()? {
                0 => CursorValue::Num(reader.u64()?),
                1 => {
                    let len = reader.u32()? as usize;
                    CursorValue::Text(
                        String::from_utf8(reader.take(len)?.to_vec())
                            .map_err(|_| CursorError::Malformed)?,
                    )
                }
                _ => return Err(CursorError::Malformed),
            };
            positions.push(CursorColumn {
                name,
                value,
                descending,
            });
        }
        if reader.pos != bytes.len() {
            return Err(CursorError::Malformed);
        }
        Ok(Cursor {
            at_block,
            positions,
        })
    }

    /// Check this cursor against the ordering a request compiled to. Every
    /// cursor column must name a column of the ordering (same sequence,
    /// same direction); anything else is a caller error, not a silent
    /// misorder.
    pub fn verify(&self, order: &[OrderSpec]) -> Result<(), CursorError> {
        if self.positions.len() != order.len() {
            return Err(CursorError::OrderMismatch);
        }
        for (position, spec) in self.positions.iter().zip(order) {
            if position.name != spec.column {
                return if order.iter().any(|s| s.column == position.name) {
                    Err(CursorError::OrderMismatch)
                } else {
                    Err(CursorError::UnknownColumn(position.name.clone()))
                };
            }
            if position.descending != spec.descending {
                return Err(CursorError::OrderMismatch);
            }
        }
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CursorError> {
        let end = self.pos.checked_add(len).ok_or(CursorError::Malformed)?;
        if end > self.bytes.len() {
            return Err(CursorError::Malformed);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CursorError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CursorError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CursorError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Cursor {
        Cursor {
            at_block: 42,
            positions: vec![
                CursorColumn {
                    name: "price".into(),
                    value: CursorValue::Num(1999),
                    descending: true,
                },
                CursorColumn {
                    name: "last_modified_at_block".into(),
                    value: CursorValue::Num(7),
                    descending: false,
                },
                CursorColumn {
                    name: "tx_index".into(),
                    value: CursorValue::Num(0),
                    descending: false,
                },
                CursorColumn {
                    name: "op_index".into(),
                    value: CursorValue::Num(3),
                    descending: false,
                },
            ],
        }
    }

    #[test]
    fn round_trips() {
        let cursor = sample();
        let token = cursor.encode();
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        let decoded = Cursor::decode(&token).unwrap();
        assert_eq!(decoded, cursor);
        // Decode-then-encode yields the same token.
        assert_eq!(decoded.encode(), token);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Cursor::decode("zz"), Err(CursorError::Hex));
        assert_eq!(Cursor::decode("ff"), Err(CursorError::Version(0xff)));
        // Truncated payload.
        let token = sample().encode();
        assert_eq!(
            Cursor::decode(&token[..token.len() - 2]),
            Err(CursorError::Malformed)
        );
    }

    #[test]
    fn verifies_against_the_ordering() {
        let order = vec![
            OrderSpec {
                column: "price".into(),
                numeric: true,
                descending: true,
                annotation: true,
            },
            OrderSpec {
                column: "last_modified_at_block".into(),
                numeric: true,
                descending: false,
                annotation: false,
            },
            OrderSpec {
                column: "tx_index".into(),
                numeric: true,
                descending: false,
                annotation: false,
            },
            OrderSpec {
                column: "op_index".into(),
                numeric: true,
                descending: false,
                annotation: false,
            },
        ];
        assert!(sample().verify(&order).is_ok());

        let mut unknown = sample();
        unknown.positions[0].name = "nonexistent".into();
        assert_eq!(
            unknown.verify(&order),
            Err(CursorError::UnknownColumn("nonexistent".into()))
        );

        let mut flipped = sample();
        flipped.positions[0].descending = false;
        assert_eq!(flipped.verify(&order), Err(CursorError::OrderMismatch));
    }
}
