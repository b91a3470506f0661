//! Leader side of a replication session.
//!
//! The leader answers one `MSG_GET_CHANGESETS` per session: it either
//! streams a snapshot of the engine's on-disk files followed by the WAL
//! tail, or WAL-only changesets when the follower's revision is still in
//! the log.

use crate::config::ReplicationConfig;
use crate::message::{self, Frame, IdentityPayload, MessageType, ReplyType};
use meridian_core::{DatabaseUuid, Endpoint, Error, Flags, Result};
use meridian_durability::DatabaseWal;
use meridian_pool::DatabasePool;
use meridian_storage::ENGINE_FILENAMES;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Read the current `(uuid, revision)` of a local endpoint through a
/// brief writable checkout.
fn current_state(
    pool: &DatabasePool,
    endpoint: &Endpoint,
    config: &ReplicationConfig,
) -> Result<(DatabaseUuid, u64)> {
    let shard = pool.checkout_with_timeout(endpoint, Flags::WRITABLE, config.checkout_timeout, None)?;
    let uuid = shard.get_uuid();
    let revision = shard.get_revision();
    pool.checkin(shard);
    Ok((uuid, revision))
}

/// Serve one replication session over an established stream.
///
/// Sends `REPLY_WELCOME` identifying `welcome_endpoint`, then handles
/// the follower's single `MSG_GET_CHANGESETS`.
pub fn serve_session<S: Read + Write>(
    pool: &DatabasePool,
    welcome_endpoint: &Endpoint,
    stream: &mut S,
    config: &ReplicationConfig,
) -> Result<()> {
    let (uuid, revision) = current_state(pool, welcome_endpoint, config)?;
    let welcome = IdentityPayload {
        uuid: uuid.as_bytes().to_vec(),
        revision,
        path: welcome_endpoint.path().to_string(),
    };
    message::send_message(stream, ReplyType::Welcome as u8, &welcome.to_bytes())?;

    let temp_dir = std::env::temp_dir();
    let frame = message::read_frame(stream, &temp_dir)?;
    let Frame::Message { tag, body } = frame else {
        return Err(Error::Protocol(
            "unexpected file frame from follower".to_string(),
        ));
    };
    MessageType::from_tag(tag)?;
    msg_get_changesets(pool, stream, &body, config)
}

/// Handle one `MSG_GET_CHANGESETS`.
pub fn msg_get_changesets<S: Read + Write>(
    pool: &DatabasePool,
    stream: &mut S,
    body: &[u8],
    config: &ReplicationConfig,
) -> Result<()> {
    let request = IdentityPayload::from_bytes(body)?;
    let endpoint = Endpoint::local(&request.path);
    let mut from = request.revision;

    let (mut uuid, mut revision) = match current_state(pool, &endpoint, config) {
        Ok(state) => state,
        Err(e) => {
            message::send_message(
                stream,
                ReplyType::Fail as u8,
                b"Database must have a valid path",
            )?;
            return Err(e);
        }
    };

    // Anything the follower knows is void if its identity diverged.
    if from != 0 && request.uuid != uuid.as_bytes() {
        from = 0;
    }

    // Or if the WAL no longer holds the revision it resumes from.
    let mut wal = DatabaseWal::new(endpoint.path());
    if from != 0 && wal.locate_revision(from)?.is_none() {
        from = 0;
    }

    debug!(
        endpoint = %endpoint,
        from,
        revision,
        "serving changesets"
    );

    if from < revision {
        if from == 0 {
            let mut copies_left = config.whole_db_copies;
            loop {
                message::send_message(
                    stream,
                    ReplyType::DbHeader as u8,
                    &message::encode_db_header(uuid.as_bytes(), revision),
                )?;

                for filename in ENGINE_FILENAMES {
                    let file_path = Path::new(endpoint.path()).join(filename);
                    if let Ok(mut file) = File::open(&file_path) {
                        message::send_message(
                            stream,
                            ReplyType::DbFilename as u8,
                            filename.as_bytes(),
                        )?;
                        message::send_file(stream, ReplyType::DbFiledata as u8, &mut file)?;
                    }
                }

                let (_, final_revision) = current_state(pool, &endpoint, config)?;
                message::send_message(
                    stream,
                    ReplyType::DbFooter as u8,
                    &message::encode_revision(final_revision),
                )?;

                if revision == final_revision {
                    // Snapshot is stable; the WAL tail picks up from here.
                    from = revision;
                    break;
                }
                if copies_left == 0 {
                    message::send_message(
                        stream,
                        ReplyType::Fail as u8,
                        b"Database changing too fast",
                    )?;
                    return Ok(());
                }
                copies_left -= 1;
                let (next_uuid, next_revision) = current_state(pool, &endpoint, config)?;
                uuid = next_uuid;
                revision = next_revision;
            }
        }

        let mut iterations = config.wal_iterations;
        loop {
            for (line_revision, line) in wal.find(from)? {
                message::send_message(stream, ReplyType::Changeset as u8, &line)?;
                from = line_revision + 1;
            }
            let (_, current) = current_state(pool, &endpoint, config)?;
            revision = current;
            iterations -= 1;
            if from >= revision || iterations == 0 {
                break;
            }
        }
    }

    message::send_message(stream, ReplyType::EndOfChanges as u8, b"")?;
    info!(endpoint = %endpoint, revision, "replication session served");
    Ok(())
}
