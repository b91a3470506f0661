//! Wire framing for the replication protocol.
//!
//! Every frame is `<u8 tag><varint length><body>`. File bodies use the
//! `FILE_FOLLOWS` sentinel before the real tag, telling the receiver to
//! stream the body into a temp file instead of buffering it in memory.

use meridian_core::serialise::{serialise_length, serialise_string, unserialise_length, unserialise_string};
use meridian_core::{Error, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Sentinel byte announcing a streamed file body.
pub const FILE_FOLLOWS: u8 = 0xfd;

/// Messages sent follower → leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Request changesets from a revision onwards.
    GetChangesets = 0,
}

impl MessageType {
    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Result<MessageType> {
        match tag {
            0 => Ok(MessageType::GetChangesets),
            other => Err(Error::Protocol(format!("unexpected message type {other}"))),
        }
    }
}

/// Replies sent leader → follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    /// Leader identity, sent when the follower first connects.
    Welcome = 0,
    /// The leader believes the follower is caught up.
    EndOfChanges = 1,
    /// Abort with a reason; the follower resets and detaches.
    Fail = 2,
    /// Begin a full-database copy.
    DbHeader = 3,
    /// Name of the next file in the copy.
    DbFilename = 4,
    /// Binary file payload (file-follows envelope).
    DbFiledata = 5,
    /// End of the copy, carrying the revision after the last file.
    DbFooter = 6,
    /// One replayable WAL record.
    Changeset = 7,
}

impl ReplyType {
    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Result<ReplyType> {
        match tag {
            0 => Ok(ReplyType::Welcome),
            1 => Ok(ReplyType::EndOfChanges),
            2 => Ok(ReplyType::Fail),
            3 => Ok(ReplyType::DbHeader),
            4 => Ok(ReplyType::DbFilename),
            5 => Ok(ReplyType::DbFiledata),
            6 => Ok(ReplyType::DbFooter),
            7 => Ok(ReplyType::Changeset),
            other => Err(Error::Protocol(format!("unexpected reply type {other}"))),
        }
    }

    /// Tag name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            ReplyType::Welcome => "REPLY_WELCOME",
            ReplyType::EndOfChanges => "REPLY_END_OF_CHANGES",
            ReplyType::Fail => "REPLY_FAIL",
            ReplyType::DbHeader => "REPLY_DB_HEADER",
            ReplyType::DbFilename => "REPLY_DB_FILENAME",
            ReplyType::DbFiledata => "REPLY_DB_FILEDATA",
            ReplyType::DbFooter => "REPLY_DB_FOOTER",
            ReplyType::Changeset => "REPLY_CHANGESET",
        }
    }
}

/// One received frame.
#[derive(Debug)]
pub enum Frame {
    /// An in-memory message body.
    Message {
        /// Wire tag.
        tag: u8,
        /// Message body.
        body: Vec<u8>,
    },
    /// A file body streamed to disk.
    File {
        /// Wire tag (the one after the sentinel).
        tag: u8,
        /// Temp file holding the body.
        path: PathBuf,
    },
}

/// Send one framed message.
pub fn send_message<W: Write>(writer: &mut W, tag: u8, body: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(body.len() + 10);
    frame.push(tag);
    serialise_length(&mut frame, body.len() as u64);
    frame.extend_from_slice(body);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Send a file body under the file-follows envelope.
pub fn send_file<W: Write>(writer: &mut W, tag: u8, file: &mut File) -> Result<()> {
    let len = file.metadata()?.len();
    let mut header = Vec::with_capacity(12);
    header.push(FILE_FOLLOWS);
    header.push(tag);
    serialise_length(&mut header, len);
    writer.write_all(&header)?;

    let mut remaining = len;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let want = (remaining as usize).min(buf.len());
        file.read_exact(&mut buf[..want])?;
        writer.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    writer.flush()?;
    Ok(())
}

/// Read one varint from the stream.
fn read_length<R: Read>(reader: &mut R) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        let byte = byte[0];
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(Error::Protocol("frame length overflows u64".to_string()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Upper bound for in-memory frame bodies; larger bodies must use the
/// file envelope.
const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Read one frame; file bodies stream into `temp_dir`.
pub fn read_frame<R: Read>(reader: &mut R, temp_dir: &Path) -> Result<Frame> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    let tag = tag[0];

    if tag == FILE_FOLLOWS {
        let mut real_tag = [0u8; 1];
        reader.read_exact(&mut real_tag)?;
        let len = read_length(reader)?;
        let path = inflight_path(temp_dir)?;
        let mut file = File::create(&path)?;
        let mut remaining = len;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = (remaining as usize).min(buf.len());
            reader.read_exact(&mut buf[..want])?;
            file.write_all(&buf[..want])?;
            remaining -= want as u64;
        }
        file.sync_all()?;
        return Ok(Frame::File {
            tag: real_tag[0],
            path,
        });
    }

    let len = read_length(reader)?;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!("oversized frame body: {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Frame::Message { tag, body })
}

fn inflight_path(temp_dir: &Path) -> Result<PathBuf> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = temp_dir.join(format!(".inflight.{n}"));
    Ok(path)
}

/// Identity triple used by `REPLY_WELCOME` and `MSG_GET_CHANGESETS`:
/// a UUID byte string, a revision, and an endpoint path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPayload {
    /// Database UUID bytes (may be empty for a fresh follower).
    pub uuid: Vec<u8>,
    /// Revision.
    pub revision: u64,
    /// Endpoint path.
    pub path: String,
}

impl IdentityPayload {
    /// Encode to a message body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        serialise_string(&mut body, &self.uuid);
        serialise_length(&mut body, self.revision);
        serialise_string(&mut body, self.path.as_bytes());
        body
    }

    /// Decode from a message body.
    pub fn from_bytes(body: &[u8]) -> Result<IdentityPayload> {
        let mut input = body;
        let uuid = unserialise_string(&mut input)?.to_vec();
        let revision = unserialise_length(&mut input)?;
        let path = String::from_utf8(unserialise_string(&mut input)?.to_vec())
            .map_err(|_| Error::Protocol("endpoint path is not UTF-8".to_string()))?;
        Ok(IdentityPayload {
            uuid,
            revision,
            path,
        })
    }
}

/// Encode a `(uuid, revision)` header body.
pub fn encode_db_header(uuid: &[u8], revision: u64) -> Vec<u8> {
    let mut body = Vec::new();
    serialise_string(&mut body, uuid);
    serialise_length(&mut body, revision);
    body
}

/// Decode a `(uuid, revision)` header body.
pub fn decode_db_header(body: &[u8]) -> Result<(Vec<u8>, u64)> {
    let mut input = body;
    let uuid = unserialise_string(&mut input)?.to_vec();
    let revision = unserialise_length(&mut input)?;
    Ok((uuid, revision))
}

/// Encode a bare revision body (`REPLY_DB_FOOTER`).
pub fn encode_revision(revision: u64) -> Vec<u8> {
    let mut body = Vec::new();
    serialise_length(&mut body, revision);
    body
}

/// Decode a bare revision body.
pub fn decode_revision(body: &[u8]) -> Result<u64> {
    let mut input = body;
    unserialise_length(&mut input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_message_roundtrip() {
        let mut wire = Vec::new();
        send_message(&mut wire, ReplyType::Changeset as u8, b"line-bytes").unwrap();
        send_message(&mut wire, ReplyType::EndOfChanges as u8, b"").unwrap();

        let dir = tempdir().unwrap();
        let mut reader = Cursor::new(wire);
        match read_frame(&mut reader, dir.path()).unwrap() {
            Frame::Message { tag, body } => {
                assert_eq!(tag, ReplyType::Changeset as u8);
                assert_eq!(body, b"line-bytes");
            }
            other => panic!("expected message frame, got {other:?}"),
        }
        match read_frame(&mut reader, dir.path()).unwrap() {
            Frame::Message { tag, body } => {
                assert_eq!(tag, ReplyType::EndOfChanges as u8);
                assert!(body.is_empty());
            }
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[test]
    fn test_file_envelope_streams_to_disk() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let payload = vec![0xabu8; 200_000];
        std::fs::write(&source, &payload).unwrap();

        let mut wire = Vec::new();
        let mut file = File::open(&source).unwrap();
        send_file(&mut wire, ReplyType::DbFiledata as u8, &mut file).unwrap();

        let recv_dir = tempdir().unwrap();
        let mut reader = Cursor::new(wire);
        match read_frame(&mut reader, recv_dir.path()).unwrap() {
            Frame::File { tag, path } => {
                assert_eq!(tag, ReplyType::DbFiledata as u8);
                assert_eq!(std::fs::read(path).unwrap(), payload);
            }
            other => panic!("expected file frame, got {other:?}"),
        }
    }

    #[test]
    fn test_identity_payload_roundtrip() {
        let payload = IdentityPayload {
            uuid: vec![1, 2, 3],
            revision: 42,
            path: "indexes/main".to_string(),
        };
        let decoded = IdentityPayload::from_bytes(&payload.to_bytes()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_empty_uuid_identity() {
        let payload = IdentityPayload {
            uuid: Vec::new(),
            revision: 0,
            path: "db".to_string(),
        };
        let decoded = IdentityPayload::from_bytes(&payload.to_bytes()).unwrap();
        assert!(decoded.uuid.is_empty());
        assert_eq!(decoded.revision, 0);
    }

    #[test]
    fn test_reply_type_tags() {
        for tag in 0..=7u8 {
            let reply = ReplyType::from_tag(tag).unwrap();
            assert_eq!(reply as u8, tag);
        }
        assert!(ReplyType::from_tag(99).is_err());
    }

    #[test]
    fn test_db_header_roundtrip() {
        let body = encode_db_header(&[9; 16], 77);
        let (uuid, revision) = decode_db_header(&body).unwrap();
        assert_eq!(uuid, vec![9; 16]);
        assert_eq!(revision, 77);
    }
}
