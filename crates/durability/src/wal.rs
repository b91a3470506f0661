//! Per-path WAL handle.
//!
//! `DatabaseWal` owns the write and replay surfaces over the volumes of
//! one database path. Corruption is contained: the offending volumes are
//! quarantined (renamed aside, never deleted), a counter is bumped, and
//! the engine files are left untouched.

use crate::codec::{Lz4Codec, StorageCodec};
use crate::metrics::WAL_METRICS;
use crate::record::{decode_line, encode_line, peek_revision, WalOperation};
use crate::volume::{WalVolume, STORAGE_START_BLOCK_OFFSET, WAL_SLOTS};
use meridian_core::{DatabaseUuid, Error, Result};
use meridian_storage::{Document, GlassEngine, Marker, MARKER_FILENAME};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Write and replay handle for one database path's WAL.
pub struct DatabaseWal {
    base_path: PathBuf,
    uuid: DatabaseUuid,
    validate_uuid: bool,
    volume: Option<WalVolume>,
    codec: Box<dyn StorageCodec>,
}

impl DatabaseWal {
    /// Open a WAL handle for `base_path`.
    ///
    /// If the database marker is readable its UUID is used to validate
    /// volume headers; otherwise validation starts once the first line is
    /// written.
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        let base_path = base_path.as_ref().to_path_buf();
        let (uuid, validate_uuid) = match Marker::read(&base_path.join(MARKER_FILENAME)) {
            Ok(Some(marker)) => (marker.uuid, true),
            _ => (DatabaseUuid::NIL, false),
        };
        DatabaseWal {
            base_path,
            uuid,
            validate_uuid,
            volume: None,
            codec: Box::new(Lz4Codec),
        }
    }

    /// Database path this WAL belongs to.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// UUID the WAL validates volumes against.
    pub fn uuid(&self) -> DatabaseUuid {
        self.uuid
    }

    /// Append one operation at `revision`.
    ///
    /// A COMMIT is logged one prior to the given (already advanced)
    /// revision. On corruption the volumes are quarantined and the error
    /// is returned.
    pub fn write_line(
        &mut self,
        uuid: DatabaseUuid,
        revision: u64,
        op: &WalOperation,
    ) -> Result<()> {
        self.uuid = uuid;
        self.validate_uuid = true;

        let is_commit = matches!(op, WalOperation::Commit);
        let mut revision = revision;
        if is_commit {
            revision = revision.saturating_sub(1);
        }
        let line = encode_line(revision, op, self.codec.as_ref());

        match self.write_line_inner(revision, &line, is_commit) {
            Ok(()) => Ok(()),
            Err(e @ Error::CorruptWal(_)) => {
                warn!(
                    path = %self.base_path.display(),
                    error = %e,
                    "WAL write failed, quarantining volumes"
                );
                WAL_METRICS.record_error();
                if let Err(qe) = self.quarantine() {
                    warn!(path = %self.base_path.display(), error = %qe, "WAL quarantine failed");
                }
                Err(e)
            }
            Err(e) => {
                WAL_METRICS.record_error();
                Err(e)
            }
        }
    }

    fn write_line_inner(&mut self, revision: u64, line: &[u8], is_commit: bool) -> Result<()> {
        // A cached volume stamped for another database (the path was
        // switched underneath us) must not be appended to.
        if let Some(volume) = &self.volume {
            if !volume.uuid().is_nil() && !self.uuid.matches(&volume.uuid()) {
                self.volume = None;
            }
        }

        if self.volume.is_none() {
            let volumes = WalVolume::list_volumes(&self.base_path)?;
            let base = volumes
                .iter()
                .copied()
                .filter(|&v| v <= revision)
                .max()
                .unwrap_or(revision);
            self.volume = Some(WalVolume::open_or_create(&self.base_path, base, self.uuid)?);
        }

        let base = self
            .volume
            .as_ref()
            .expect("volume is open for writing")
            .base_revision();
        if base > revision {
            return Err(Error::CorruptWal(format!(
                "invalid WAL revision {revision}: too old for volume {base}"
            )));
        }
        if (revision - base) as usize >= WAL_SLOTS {
            // The old volume is full, rotate.
            self.volume = Some(WalVolume::open_or_create(
                &self.base_path,
                revision,
                self.uuid,
            )?);
        }

        let volume = self.volume.as_mut().expect("volume is open for writing");
        let slot = (revision - volume.base_revision()) as usize;

        if slot > 0 && volume.slot(slot - 1) == 0 {
            return Err(Error::CorruptWal(format!(
                "missing predecessor slot for revision {revision}"
            )));
        }
        if slot + 1 < WAL_SLOTS && volume.slot(slot + 1) != 0 {
            return Err(Error::CorruptWal(format!(
                "slot already occupied for revision {revision}"
            )));
        }

        let end = volume.append_record(line)?;
        volume.set_slot(slot, end)?;

        if is_commit {
            if slot + 1 < WAL_SLOTS {
                // Seed the next revision's slot so the write frontier
                // (and the highest valid slot) advances past the commit.
                volume.set_slot(slot + 1, end)?;
            } else {
                // The volume is full; eagerly open the next one.
                self.volume = Some(WalVolume::open_or_create(
                    &self.base_path,
                    revision + 1,
                    self.uuid,
                )?);
            }
        }
        Ok(())
    }

    /// Replay the WAL onto `engine`, containing corruption.
    ///
    /// On `CorruptWal` the volumes are quarantined and the engine is left
    /// at whatever revision it had reached; the error is absorbed. Other
    /// errors propagate. Returns whether uncommitted modifications were
    /// applied.
    pub fn replay(&mut self, engine: &mut GlassEngine, only_committed: bool) -> Result<bool> {
        match self.execute(engine, only_committed, false) {
            Ok(modified) => Ok(modified),
            Err(e @ Error::CorruptWal(_)) => {
                warn!(
                    path = %self.base_path.display(),
                    error = %e,
                    "WAL corrupt during replay, quarantining volumes"
                );
                WAL_METRICS.record_error();
                if let Err(qe) = self.quarantine() {
                    warn!(path = %self.base_path.display(), error = %qe, "WAL quarantine failed");
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Replay the WAL onto `engine` starting from the engine's current
    /// revision.
    ///
    /// With `only_committed`, operations after the last COMMIT are not
    /// applied. In `unsafe_mode`, recoverable inconsistencies are logged
    /// and skipped instead of failing.
    pub fn execute(
        &mut self,
        engine: &mut GlassEngine,
        only_committed: bool,
        unsafe_mode: bool,
    ) -> Result<bool> {
        let start_revision = engine.get_revision();
        let volumes = WalVolume::list_volumes(&self.base_path)?;
        if volumes.is_empty() {
            return Ok(false);
        }
        let first = volumes
            .iter()
            .copied()
            .filter(|&v| v <= start_revision)
            .max()
            .ok_or_else(|| {
                Error::CorruptWal(format!(
                    "missing WAL volumes; the first one found is beyond current revision {start_revision}"
                ))
            })?;

        let engine_uuid = engine.get_uuid();
        let mut modified = false;
        let mut reached: Option<u64> = None;
        let mut pending: Vec<WalOperation> = Vec::new();

        for &base in volumes.iter().filter(|&&v| v >= first) {
            let mut volume = WalVolume::open(&self.base_path, base, false)?;
            if self.validate_uuid
                && !volume.uuid().is_nil()
                && !engine_uuid.matches(&volume.uuid())
            {
                return Err(Error::CorruptWal("WAL UUID mismatch".to_string()));
            }

            let Some(high) = volume.highest_valid_slot() else {
                if engine.get_revision() != base && !unsafe_mode {
                    return Err(Error::CorruptWal(format!(
                        "no WAL slots in volume {base} while trying to reach revision {}",
                        engine.get_revision()
                    )));
                }
                reached = Some(reached.map_or(base, |r| r.max(base)));
                continue;
            };
            let volume_end = base + u64::from(high);
            reached = Some(reached.map_or(volume_end, |r| r.max(volume_end)));
            if volume_end < engine.get_revision() {
                continue;
            }

            let start_off = if base == first {
                let current = engine.get_revision();
                if current == base {
                    STORAGE_START_BLOCK_OFFSET
                } else {
                    let offset = volume.slot((current - base - 1) as usize);
                    if offset == 0 {
                        return Err(Error::CorruptWal(format!(
                            "missing slot for revision {current} in volume {base}"
                        )));
                    }
                    offset
                }
            } else {
                STORAGE_START_BLOCK_OFFSET
            };
            let end_off = volume.slot(high as usize);
            if start_off >= end_off {
                continue;
            }

            info!(
                path = %self.base_path.display(),
                volume = base,
                "replaying WAL records"
            );

            for line in volume.read_lines(start_off, end_off)? {
                let (revision, op) = decode_line(&line, self.codec.as_ref())?;
                if revision != engine.get_revision() {
                    if !unsafe_mode {
                        return Err(Error::CorruptWal(format!(
                            "WAL revision mismatch: expected {}, got {revision}",
                            engine.get_revision()
                        )));
                    }
                    warn!(
                        path = %self.base_path.display(),
                        expected = engine.get_revision(),
                        got = revision,
                        "WAL revision mismatch"
                    );
                }
                if matches!(op, WalOperation::Commit) {
                    for pending_op in pending.drain(..) {
                        apply_operation(engine, pending_op, unsafe_mode)?;
                    }
                    engine.commit()?;
                    modified = false;
                } else {
                    pending.push(op);
                }
            }
        }

        if !pending.is_empty() && !only_committed {
            for op in pending.drain(..) {
                apply_operation(engine, op, unsafe_mode)?;
            }
            modified = true;
        }

        if let Some(reached) = reached {
            if reached < start_revision {
                return Err(Error::CorruptWal(format!(
                    "WAL did not reach the current revision {start_revision}, WAL ends at {reached}"
                )));
            }
        }

        Ok(modified)
    }

    /// Append an already-encoded WAL line at its embedded revision.
    ///
    /// Used by the replication follower, which receives finished lines
    /// (COMMITs already carry their stored revision). Corruption
    /// quarantines like `write_line`.
    pub fn append_line(&mut self, line: &[u8]) -> Result<()> {
        let (revision, tag) = crate::record::peek_revision_and_type(line)?;
        let is_commit = tag == WalOperation::Commit.tag();
        match self.write_line_inner(revision, line, is_commit) {
            Ok(()) => Ok(()),
            Err(e @ Error::CorruptWal(_)) => {
                warn!(
                    path = %self.base_path.display(),
                    error = %e,
                    "WAL append failed, quarantining volumes"
                );
                WAL_METRICS.record_error();
                if let Err(qe) = self.quarantine() {
                    warn!(path = %self.base_path.display(), error = %qe, "WAL quarantine failed");
                }
                Err(e)
            }
            Err(e) => {
                WAL_METRICS.record_error();
                Err(e)
            }
        }
    }

    /// Apply one replicated WAL line to `engine`.
    ///
    /// Used by the replication follower; the line is executed but never
    /// re-logged. Returns whether the line left uncommitted modifications.
    pub fn execute_line(
        &mut self,
        engine: &mut GlassEngine,
        line: &[u8],
        unsafe_mode: bool,
    ) -> Result<bool> {
        let (revision, op) = decode_line(line, self.codec.as_ref())?;
        if revision != engine.get_revision() {
            if !unsafe_mode {
                return Err(Error::CorruptWal(format!(
                    "WAL revision mismatch: expected {}, got {revision}",
                    engine.get_revision()
                )));
            }
            warn!(
                path = %self.base_path.display(),
                expected = engine.get_revision(),
                got = revision,
                "WAL revision mismatch"
            );
        }
        if matches!(op, WalOperation::Commit) {
            engine.commit()?;
            Ok(false)
        } else {
            apply_operation(engine, op, unsafe_mode)?;
            Ok(true)
        }
    }

    /// Whether the WAL still holds `revision`.
    ///
    /// Returns the base revision and highest filled slot of the volume
    /// containing it.
    pub fn locate_revision(&mut self, revision: u64) -> Result<Option<(u64, u32)>> {
        let volumes = WalVolume::list_volumes(&self.base_path)?;
        let Some(base) = volumes.iter().copied().filter(|&v| v <= revision).max() else {
            return Ok(None);
        };
        if revision - base >= WAL_SLOTS as u64 {
            return Ok(None);
        }
        let volume = WalVolume::open(&self.base_path, base, false)?;
        let Some(high) = volume.highest_valid_slot() else {
            return Ok(None);
        };
        let slot = (revision - base) as u32;
        if slot <= high {
            Ok(Some((base, high)))
        } else {
            Ok(None)
        }
    }

    /// Raw WAL lines carrying revisions `from_revision` onwards, up to the
    /// end of the volume containing `from_revision`.
    ///
    /// Each entry is `(revision, line bytes)`. Callers streaming further
    /// revisions re-invoke with the last revision plus one.
    pub fn find(&mut self, from_revision: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let Some((base, high)) = self.locate_revision(from_revision)? else {
            return Ok(Vec::new());
        };
        let mut volume = WalVolume::open(&self.base_path, base, false)?;
        let start_off = if base < from_revision {
            let offset = volume.slot((from_revision - base - 1) as usize);
            if offset == 0 {
                return Err(Error::CorruptWal(format!(
                    "missing slot for revision {from_revision} in volume {base}"
                )));
            }
            offset
        } else {
            STORAGE_START_BLOCK_OFFSET
        };
        let end_off = volume.slot(high as usize);
        if start_off >= end_off {
            return Ok(Vec::new());
        }
        volume
            .read_lines(start_off, end_off)?
            .into_iter()
            .map(|line| Ok((peek_revision(&line)?, line)))
            .collect()
    }

    /// Serialise WAL contents in `[start_revision, end_revision]` to a
    /// structured value for inspection. Never blocks writers or mutates
    /// state; unreadable volumes are reported inline.
    pub fn repr(&self, start_revision: u64, end_revision: u64) -> Result<serde_json::Value> {
        let volumes = WalVolume::list_volumes(&self.base_path)?;
        let first = volumes
            .iter()
            .copied()
            .filter(|&v| v <= start_revision)
            .max()
            .or_else(|| volumes.first().copied());

        let mut entries = Vec::new();
        let Some(first) = first else {
            return Ok(serde_json::Value::Array(entries));
        };

        for &base in volumes.iter().filter(|&&v| v >= first) {
            if base > end_revision {
                break;
            }
            let mut volume = match WalVolume::open(&self.base_path, base, false) {
                Ok(volume) => volume,
                Err(e) => {
                    entries.push(json!({ "volume": base, "error": e.to_string() }));
                    continue;
                }
            };
            let Some(high) = volume.highest_valid_slot() else {
                continue;
            };

            let start_off = if base == first && start_revision > base {
                let slot = (start_revision - base - 1) as usize;
                if slot < WAL_SLOTS && volume.slot(slot) != 0 {
                    volume.slot(slot)
                } else {
                    STORAGE_START_BLOCK_OFFSET
                }
            } else {
                STORAGE_START_BLOCK_OFFSET
            };
            let end_off = volume.slot(high as usize);
            if start_off >= end_off {
                continue;
            }

            let lines = match volume.read_lines(start_off, end_off) {
                Ok(lines) => lines,
                Err(e) => {
                    entries.push(json!({ "volume": base, "error": e.to_string() }));
                    continue;
                }
            };
            for line in lines {
                match decode_line(&line, self.codec.as_ref()) {
                    Ok((revision, op)) => {
                        if revision > end_revision {
                            break;
                        }
                        entries.push(repr_line(revision, &op));
                    }
                    Err(e) => entries.push(json!({ "volume": base, "error": e.to_string() })),
                }
            }
        }
        Ok(serde_json::Value::Array(entries))
    }

    /// Rename every volume of this path aside so it can be inspected
    /// after a corruption event. The volumes are never deleted.
    pub fn quarantine(&mut self) -> Result<()> {
        self.volume = None;
        let volumes = WalVolume::list_volumes(&self.base_path)?;
        let mut count = 0u64;
        for base in volumes {
            let from = WalVolume::volume_path(&self.base_path, base);
            let mut to = self.base_path.join(format!("wal.{base}.corrupt"));
            let mut n = 1;
            while to.exists() {
                to = self.base_path.join(format!("wal.{base}.corrupt-{n}"));
                n += 1;
            }
            std::fs::rename(&from, &to)?;
            count += 1;
        }
        if count > 0 {
            WAL_METRICS.record_quarantined(count);
            warn!(
                path = %self.base_path.display(),
                volumes = count,
                "quarantined WAL volumes"
            );
        }
        Ok(())
    }
}

fn apply_operation(engine: &mut GlassEngine, op: WalOperation, unsafe_mode: bool) -> Result<()> {
    match op {
        WalOperation::Commit => {
            engine.commit()?;
        }
        WalOperation::ReplaceDocument { docid, document } => {
            let document = Document::unserialise(&document)
                .map_err(|e| Error::CorruptWal(format!("bad document in WAL record: {e}")))?;
            engine.replace_document(docid, document)?;
        }
        WalOperation::DeleteDocument { docid } => {
            if let Err(e) = engine.delete_document(docid) {
                if !unsafe_mode {
                    return Err(e);
                }
                warn!(error = %e, "error during DELETE_DOCUMENT");
            }
        }
        WalOperation::SetMetadata { key, value } => {
            engine.set_metadata(key, value)?;
        }
        WalOperation::AddSpelling { term, freq } => {
            engine.add_spelling(term, freq)?;
        }
        WalOperation::RemoveSpelling { term, freq } => {
            engine.remove_spelling(&term, freq)?;
        }
    }
    Ok(())
}

fn repr_line(revision: u64, op: &WalOperation) -> serde_json::Value {
    match op {
        WalOperation::Commit => json!({ "revision": revision, "op": op.name() }),
        WalOperation::ReplaceDocument { docid, document } => {
            let data = Document::unserialise(document)
                .map(|doc| String::from_utf8_lossy(doc.data()).into_owned())
                .unwrap_or_default();
            json!({ "revision": revision, "op": op.name(), "docid": docid, "document": data })
        }
        WalOperation::DeleteDocument { docid } => {
            json!({ "revision": revision, "op": op.name(), "docid": docid })
        }
        WalOperation::SetMetadata { key, value } => {
            json!({
                "revision": revision,
                "op": op.name(),
                "key": key,
                "data": String::from_utf8_lossy(value).into_owned(),
            })
        }
        WalOperation::AddSpelling { term, freq } | WalOperation::RemoveSpelling { term, freq } => {
            json!({ "revision": revision, "op": op.name(), "term": term, "freq": freq })
        }
    }
}
