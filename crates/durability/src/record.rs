//! WAL record encoding.
//!
//! A WAL line is `varint(revision) ++ varint(type) ++ codec(payload)`.
//! The same line bytes travel three ways: appended to a volume (framed
//! with a length prefix and CRC), replayed against an engine, and sent as
//! a replication changeset.

use crate::codec::StorageCodec;
use meridian_core::serialise::{
    serialise_length, serialise_string, unserialise_length, unserialise_string,
};
use meridian_core::{Error, Result};

/// One replayable WAL operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalOperation {
    /// Finalise the current revision.
    Commit,
    /// Insert or replace a document.
    ReplaceDocument {
        /// Target document id.
        docid: u32,
        /// Serialised document bytes.
        document: Vec<u8>,
    },
    /// Remove a document.
    DeleteDocument {
        /// Target document id.
        docid: u32,
    },
    /// Set (or, with an empty value, remove) a metadata entry.
    SetMetadata {
        /// Metadata key.
        key: String,
        /// Metadata value bytes.
        value: Vec<u8>,
    },
    /// Increase a spelling term's frequency.
    AddSpelling {
        /// Spelling term.
        term: String,
        /// Frequency increment.
        freq: u32,
    },
    /// Decrease a spelling term's frequency.
    RemoveSpelling {
        /// Spelling term.
        term: String,
        /// Frequency decrement.
        freq: u32,
    },
}

impl WalOperation {
    /// Numeric tag of the operation type.
    pub fn tag(&self) -> u64 {
        match self {
            WalOperation::Commit => 0,
            WalOperation::ReplaceDocument { .. } => 1,
            WalOperation::DeleteDocument { .. } => 2,
            WalOperation::SetMetadata { .. } => 3,
            WalOperation::AddSpelling { .. } => 4,
            WalOperation::RemoveSpelling { .. } => 5,
        }
    }

    /// Operation name, for logs and the structured repr.
    pub fn name(&self) -> &'static str {
        match self {
            WalOperation::Commit => "COMMIT",
            WalOperation::ReplaceDocument { .. } => "REPLACE_DOCUMENT",
            WalOperation::DeleteDocument { .. } => "DELETE_DOCUMENT",
            WalOperation::SetMetadata { .. } => "SET_METADATA",
            WalOperation::AddSpelling { .. } => "ADD_SPELLING",
            WalOperation::RemoveSpelling { .. } => "REMOVE_SPELLING",
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            WalOperation::Commit => {}
            WalOperation::ReplaceDocument { docid, document } => {
                serialise_length(&mut buf, u64::from(*docid));
                buf.extend_from_slice(document);
            }
            WalOperation::DeleteDocument { docid } => {
                serialise_length(&mut buf, u64::from(*docid));
            }
            WalOperation::SetMetadata { key, value } => {
                serialise_string(&mut buf, key.as_bytes());
                buf.extend_from_slice(value);
            }
            WalOperation::AddSpelling { term, freq }
            | WalOperation::RemoveSpelling { term, freq } => {
                serialise_length(&mut buf, u64::from(*freq));
                buf.extend_from_slice(term.as_bytes());
            }
        }
        buf
    }

    fn from_payload(tag: u64, payload: &[u8]) -> Result<WalOperation> {
        let mut input = payload;
        let op = match tag {
            0 => WalOperation::Commit,
            1 => {
                let docid = read_docid(&mut input)?;
                WalOperation::ReplaceDocument {
                    docid,
                    document: input.to_vec(),
                }
            }
            2 => WalOperation::DeleteDocument {
                docid: read_docid(&mut input)?,
            },
            3 => {
                let key = unserialise_string(&mut input)?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|_| Error::CorruptWal("metadata key is not UTF-8".to_string()))?;
                WalOperation::SetMetadata {
                    key,
                    value: input.to_vec(),
                }
            }
            4 | 5 => {
                let freq = unserialise_length(&mut input)? as u32;
                let term = String::from_utf8(input.to_vec())
                    .map_err(|_| Error::CorruptWal("spelling term is not UTF-8".to_string()))?;
                if tag == 4 {
                    WalOperation::AddSpelling { term, freq }
                } else {
                    WalOperation::RemoveSpelling { term, freq }
                }
            }
            other => {
                return Err(Error::CorruptWal(format!("invalid WAL message type {other}")));
            }
        };
        Ok(op)
    }
}

fn read_docid(input: &mut &[u8]) -> Result<u32> {
    let docid = unserialise_length(input)?;
    u32::try_from(docid).map_err(|_| Error::CorruptWal(format!("document id {docid} out of range")))
}

/// Encode a WAL line for `revision`.
pub fn encode_line(revision: u64, op: &WalOperation, codec: &dyn StorageCodec) -> Vec<u8> {
    let mut line = Vec::new();
    serialise_length(&mut line, revision);
    serialise_length(&mut line, op.tag());
    line.extend_from_slice(&codec.encode(&op.payload()));
    line
}

/// Decode a WAL line into its revision and operation.
pub fn decode_line(line: &[u8], codec: &dyn StorageCodec) -> Result<(u64, WalOperation)> {
    let mut input = line;
    let revision = unserialise_length(&mut input)?;
    let tag = unserialise_length(&mut input)?;
    let payload = codec
        .decode(input)
        .map_err(|e| Error::CorruptWal(e.to_string()))?;
    Ok((revision, WalOperation::from_payload(tag, &payload)?))
}

/// Read only the revision a WAL line carries.
pub fn peek_revision(line: &[u8]) -> Result<u64> {
    let mut input = line;
    unserialise_length(&mut input)
}

/// Read the revision and type tag a WAL line carries.
pub fn peek_revision_and_type(line: &[u8]) -> Result<(u64, u64)> {
    let mut input = line;
    let revision = unserialise_length(&mut input)?;
    let tag = unserialise_length(&mut input)?;
    Ok((revision, tag))
}
