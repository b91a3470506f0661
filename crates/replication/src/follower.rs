//! Follower side of a replication session.
//!
//! The follower holds its live writable shard for the whole session
//! (serialising concurrent snapshot installs), streams snapshot files
//! into a temp directory under the live path, applies changesets through
//! its WAL, and promotes a completed snapshot by rename under the
//! endpoint's exclusive lock. A failed snapshot only ever loses the temp
//! directory.

use crate::config::ReplicationConfig;
use crate::message::{self, Frame, IdentityPayload, MessageType, ReplyType};
use meridian_core::{Endpoint, Error, Flags, Result};
use meridian_durability::DatabaseWal;
use meridian_pool::{DatabasePool, Shard};
use meridian_storage::{Marker, MARKER_FILENAME};
use rand::Rng;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a completed follower session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerOutcome {
    /// Revision the follower ended at.
    pub revision: u64,
    /// Whether a full snapshot was installed.
    pub switched: bool,
    /// Changesets applied.
    pub changesets: usize,
}

/// Connect to the leader at `src` and converge the local shard at `dst`
/// onto it.
pub fn replicate(
    pool: &DatabasePool,
    src: &Endpoint,
    dst: &Endpoint,
    config: &ReplicationConfig,
) -> Result<FollowerOutcome> {
    let node = src.node().ok_or_else(|| {
        Error::InvalidOperation("replication source must name a remote node".to_string())
    })?;
    let stream = TcpStream::connect((node.host.as_str(), node.replication_port))?;
    stream.set_read_timeout(Some(config.idle_timeout))?;
    stream.set_write_timeout(Some(config.active_timeout))?;
    let mut stream = stream;
    run_session(pool, &mut stream, src.path(), dst, config)
}

/// Drive a follower session over an established stream.
///
/// `src_path` is the leader-side path requested in
/// `MSG_GET_CHANGESETS`; `dst` is the local endpoint being converged.
pub fn run_session<S: Read + Write>(
    pool: &DatabasePool,
    stream: &mut S,
    src_path: &str,
    dst: &Endpoint,
    config: &ReplicationConfig,
) -> Result<FollowerOutcome> {
    let live = pool.checkout_with_timeout(
        dst,
        Flags::WRITABLE | Flags::CREATE_OR_OPEN,
        config.checkout_timeout,
        None,
    )?;

    let mut session = Session {
        pool,
        dst,
        config,
        src_path: src_path.to_string(),
        live: Some(live),
        live_wal: None,
        switch_path: None,
        switch_shard: None,
        switch_wal: None,
        current_file: None,
        expected_revision: None,
        changesets: 0,
        switched: false,
        welcomed: false,
    };
    let result = session.run(stream);
    session.cleanup();
    result
}

struct Session<'a> {
    pool: &'a DatabasePool,
    dst: &'a Endpoint,
    config: &'a ReplicationConfig,
    src_path: String,
    live: Option<Arc<Shard>>,
    live_wal: Option<DatabaseWal>,
    switch_path: Option<PathBuf>,
    switch_shard: Option<Arc<Shard>>,
    switch_wal: Option<DatabaseWal>,
    current_file: Option<PathBuf>,
    expected_revision: Option<u64>,
    changesets: usize,
    switched: bool,
    welcomed: bool,
}

impl Session<'_> {
    fn run<S: Read + Write>(&mut self, stream: &mut S) -> Result<FollowerOutcome> {
        loop {
            let temp_dir = self
                .switch_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(self.dst.path()));
            match message::read_frame(stream, &temp_dir)? {
                Frame::Message { tag, body } => {
                    let reply = ReplyType::from_tag(tag)?;
                    if !self.welcomed && reply != ReplyType::Welcome {
                        return Err(Error::Protocol(format!(
                            "{} before REPLY_WELCOME",
                            reply.name()
                        )));
                    }
                    match reply {
                        ReplyType::Welcome => self.reply_welcome(stream, &body)?,
                        ReplyType::DbHeader => self.reply_db_header(&body)?,
                        ReplyType::DbFilename => self.reply_db_filename(&body)?,
                        ReplyType::DbFiledata => {
                            return Err(Error::Protocol(
                                "REPLY_DB_FILEDATA without file envelope".to_string(),
                            ));
                        }
                        ReplyType::DbFooter => self.reply_db_footer(&body)?,
                        ReplyType::Changeset => self.reply_changeset(&body)?,
                        ReplyType::EndOfChanges => return self.reply_end_of_changes(),
                        ReplyType::Fail => {
                            let reason = String::from_utf8_lossy(&body).into_owned();
                            warn!(endpoint = %self.dst, reason = %reason, "replication failed");
                            return Err(Error::ReplicationFailed(reason));
                        }
                    }
                }
                Frame::File { tag, path } => {
                    let reply = ReplyType::from_tag(tag)?;
                    if !self.welcomed || reply != ReplyType::DbFiledata {
                        let _ = fs::remove_file(&path);
                        return Err(Error::Protocol(format!(
                            "unexpected file frame {}",
                            reply.name()
                        )));
                    }
                    self.reply_db_filedata(path)?;
                }
            }
        }
    }

    fn reply_welcome<S: Read + Write>(&mut self, stream: &mut S, _body: &[u8]) -> Result<()> {
        if self.welcomed {
            return Err(Error::Protocol("duplicate REPLY_WELCOME".to_string()));
        }
        self.welcomed = true;
        let live = self.live.as_ref().expect("live shard held for session");
        let payload = IdentityPayload {
            uuid: live.get_uuid().as_bytes().to_vec(),
            revision: live.get_revision(),
            path: self.src_path.clone(),
        };
        debug!(endpoint = %self.dst, revision = payload.revision, "requesting changesets");
        message::send_message(stream, MessageType::GetChangesets as u8, &payload.to_bytes())
    }

    fn reply_db_header(&mut self, body: &[u8]) -> Result<()> {
        let (_uuid, revision) = message::decode_db_header(body)?;
        self.reset_switch();
        let temp = make_temp_dir(Path::new(self.dst.path()))?;
        debug!(endpoint = %self.dst, revision, temp = %temp.display(), "receiving snapshot");
        self.switch_path = Some(temp);
        self.expected_revision = Some(revision);
        Ok(())
    }

    fn reply_db_filename(&mut self, body: &[u8]) -> Result<()> {
        let switch = self
            .switch_path
            .as_ref()
            .ok_or_else(|| Error::Protocol("REPLY_DB_FILENAME outside a snapshot".to_string()))?;
        let name = String::from_utf8(body.to_vec())
            .map_err(|_| Error::Protocol("snapshot filename is not UTF-8".to_string()))?;
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::Protocol(format!("unsafe snapshot filename {name:?}")));
        }
        self.current_file = Some(switch.join(name));
        Ok(())
    }

    fn reply_db_filedata(&mut self, temp_file: PathBuf) -> Result<()> {
        let Some(target) = self.current_file.take() else {
            let _ = fs::remove_file(&temp_file);
            return Err(Error::Protocol(
                "REPLY_DB_FILEDATA without a filename".to_string(),
            ));
        };
        fs::rename(&temp_file, &target)?;
        Ok(())
    }

    fn reply_db_footer(&mut self, body: &[u8]) -> Result<()> {
        let revision = message::decode_revision(body)?;
        let Some(expected) = self.expected_revision else {
            return Err(Error::Protocol(
                "REPLY_DB_FOOTER outside a snapshot".to_string(),
            ));
        };
        if revision != expected {
            // The database changed during the copy; discard the files and
            // wait for the next attempt.
            debug!(endpoint = %self.dst, expected, got = revision, "snapshot revision moved, discarding");
            self.reset_switch();
        }
        Ok(())
    }

    fn reply_changeset(&mut self, line: &[u8]) -> Result<()> {
        if let Some(switch_path) = self.switch_path.clone() {
            if self.switch_shard.is_none() {
                let endpoint = Endpoint::local(switch_path.to_string_lossy());
                let shard = self.pool.checkout_with_timeout(
                    &endpoint,
                    Flags::WRITABLE | Flags::SYNC_WAL,
                    self.config.checkout_timeout,
                    None,
                )?;
                shard.begin_transaction(false)?;
                self.switch_wal = Some(DatabaseWal::new(&switch_path));
                self.switch_shard = Some(shard);
            }
            let shard = self.switch_shard.as_ref().expect("switch shard is open");
            let wal = self.switch_wal.as_mut().expect("switch WAL is open");
            shard.with_engine(|engine| -> Result<()> {
                wal.append_line(line)?;
                wal.execute_line(engine, line, false)?;
                Ok(())
            })?;
        } else {
            if self.live_wal.is_none() {
                let live = self.live.as_ref().expect("live shard held for session");
                live.begin_transaction(false)?;
                self.live_wal = Some(DatabaseWal::new(self.dst.path()));
            }
            let live = self.live.as_ref().expect("live shard held for session");
            let wal = self.live_wal.as_mut().expect("live WAL is open");
            live.with_engine(|engine| -> Result<()> {
                wal.append_line(line)?;
                wal.execute_line(engine, line, false)?;
                Ok(())
            })?;
        }
        self.changesets += 1;
        Ok(())
    }

    fn reply_end_of_changes(&mut self) -> Result<FollowerOutcome> {
        let switching = self.switch_path.is_some();
        if switching {
            // Close the in-progress database.
            if let Some(shard) = self.switch_shard.take() {
                shard.close();
                self.pool.checkin(shard);
            }
            self.switch_wal = None;
            let switch_path = self
                .switch_path
                .clone()
                .expect("switching implies a temp directory");

            let live = self
                .live
                .clone()
                .expect("live shard held for session");
            // Close the live handle before promoting; the endpoint
            // retires it at checkin and the next checkout opens the
            // promoted files.
            live.do_close(false, false);

            self.pool.lock(&live, self.config.checkout_timeout)?;
            let promoted = promote(&switch_path, Path::new(self.dst.path()));
            let unlocked = self.pool.unlock(&live);
            promoted?;
            unlocked?;
            self.switch_path = None;
            self.expected_revision = None;
            self.switched = true;
        }

        let revision = Marker::read(&Path::new(self.dst.path()).join(MARKER_FILENAME))?
            .map(|marker| marker.revision)
            .unwrap_or(0);
        info!(
            endpoint = %self.dst,
            revision,
            changesets = self.changesets,
            switched = self.switched,
            "replication completed"
        );
        Ok(FollowerOutcome {
            revision,
            switched: self.switched,
            changesets: self.changesets,
        })
    }

    fn reset_switch(&mut self) {
        self.switch_wal = None;
        if let Some(shard) = self.switch_shard.take() {
            shard.close();
            self.pool.checkin(shard);
        }
        if let Some(path) = self.switch_path.take() {
            let _ = fs::remove_dir_all(&path);
        }
        self.current_file = None;
        self.expected_revision = None;
    }

    fn cleanup(&mut self) {
        self.reset_switch();
        if let Some(live) = self.live.take() {
            self.pool.checkin(live);
        }
    }
}

/// Replace the live database files with the received snapshot.
///
/// Runs under the endpoint's exclusive lock: engine files and WAL
/// volumes are deleted, then everything in the temp directory moves over
/// by rename.
fn promote(switch: &Path, live: &Path) -> Result<()> {
    for entry in fs::read_dir(live)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with("glass") || name.starts_with("wal.") {
            fs::remove_file(entry.path())?;
        }
    }
    for entry in fs::read_dir(switch)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(".inflight") {
            let _ = fs::remove_file(entry.path());
            continue;
        }
        fs::rename(entry.path(), live.join(name))?;
    }
    fs::remove_dir(switch)?;
    Ok(())
}

fn make_temp_dir(base: &Path) -> Result<PathBuf> {
    let mut rng = rand::thread_rng();
    for _ in 0..32 {
        let suffix: String = (0..6)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();
        let path = base.join(format!(".tmp.{suffix}"));
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "could not create a snapshot temp directory",
    )))
}
