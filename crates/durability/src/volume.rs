//! WAL volume files.
//!
//! A volume is named `wal.<rev>` where `<rev>` is its base revision. It
//! holds a fixed-capacity slot table followed by framed records:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ magic (4) │ version (4) │ uuid (16) │ base (8) │
//! ├───────────────────────────────────────────────┤
//! │ slot[0..WAL_SLOTS) end offsets (4 each)        │
//! ├───────────────────────────────────────────────┤
//! │ length (4) │ line bytes │ crc32 (4) │ ...      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! `slot[i]` is the file offset immediately following the records of
//! revision `base + i`; zero marks an unused slot. Filled slots form a
//! strict prefix. A record is fsynced before the slot that exposes it.

use meridian_core::{DatabaseUuid, Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Revisions per volume (compile-time slot count).
pub const WAL_SLOTS: usize = 4096;

/// Magic bytes identifying a WAL volume.
pub const VOLUME_MAGIC: [u8; 4] = *b"MWAL";

/// Current volume format version.
pub const VOLUME_FORMAT_VERSION: u32 = 1;

/// Header size: fixed fields plus the slot table.
pub const VOLUME_HEADER_SIZE: usize = 32 + 4 * WAL_SLOTS;

/// Offset of the first record in a volume.
pub const STORAGE_START_BLOCK_OFFSET: u32 = VOLUME_HEADER_SIZE as u32;

/// File name prefix of WAL volumes.
pub const WAL_STORAGE_PATH: &str = "wal.";

/// One open WAL volume.
pub struct WalVolume {
    file: File,
    path: PathBuf,
    uuid: DatabaseUuid,
    base_revision: u64,
    slots: Vec<u32>,
    offset: u32,
    writable: bool,
}

impl WalVolume {
    /// Path of the volume with the given base revision.
    pub fn volume_path(dir: &Path, base_revision: u64) -> PathBuf {
        dir.join(format!("{WAL_STORAGE_PATH}{base_revision}"))
    }

    /// Create a fresh volume. Fails if the file already exists.
    pub fn create(dir: &Path, base_revision: u64, uuid: DatabaseUuid) -> Result<WalVolume> {
        let path = Self::volume_path(dir, base_revision);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut header = Vec::with_capacity(VOLUME_HEADER_SIZE);
        header.extend_from_slice(&VOLUME_MAGIC);
        header.extend_from_slice(&VOLUME_FORMAT_VERSION.to_le_bytes());
        header.extend_from_slice(uuid.as_bytes());
        header.extend_from_slice(&base_revision.to_le_bytes());
        header.resize(VOLUME_HEADER_SIZE, 0);
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(WalVolume {
            file,
            path,
            uuid,
            base_revision,
            slots: vec![0u32; WAL_SLOTS],
            offset: STORAGE_START_BLOCK_OFFSET,
            writable: true,
        })
    }

    /// Open an existing volume, validating its header against the
    /// expected base revision.
    pub fn open(dir: &Path, base_revision: u64, writable: bool) -> Result<WalVolume> {
        let path = Self::volume_path(dir, base_revision);
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)?;

        let mut header = vec![0u8; VOLUME_HEADER_SIZE];
        file.read_exact(&mut header)
            .map_err(|_| Error::CorruptWal(format!("truncated WAL header: {}", path.display())))?;

        if header[0..4] != VOLUME_MAGIC {
            return Err(Error::CorruptWal(format!(
                "bad WAL magic: {}",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != VOLUME_FORMAT_VERSION {
            return Err(Error::CorruptWal(format!(
                "unsupported WAL format version {version}: {}",
                path.display()
            )));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&header[8..24]);
        let header_revision = u64::from_le_bytes(header[24..32].try_into().unwrap());
        if header_revision != base_revision {
            return Err(Error::CorruptWal(format!(
                "mismatch in WAL revision {header_revision}: {} volume {base_revision}",
                path.display()
            )));
        }

        let mut slots = vec![0u32; WAL_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let at = 32 + 4 * i;
            *slot = u32::from_le_bytes(header[at..at + 4].try_into().unwrap());
        }

        let offset = slots
            .iter()
            .copied()
            .max()
            .filter(|&o| o != 0)
            .unwrap_or(STORAGE_START_BLOCK_OFFSET);

        Ok(WalVolume {
            file,
            path,
            uuid: DatabaseUuid::from_bytes(uuid),
            base_revision,
            slots,
            offset,
            writable,
        })
    }

    /// Open the volume if present, otherwise create it.
    pub fn open_or_create(dir: &Path, base_revision: u64, uuid: DatabaseUuid) -> Result<WalVolume> {
        match Self::open(dir, base_revision, true) {
            Ok(volume) => Ok(volume),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::create(dir, base_revision, uuid)
            }
            Err(e) => Err(e),
        }
    }

    /// Volume file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// UUID stamped in the header.
    pub fn uuid(&self) -> DatabaseUuid {
        self.uuid
    }

    /// Base revision of the volume.
    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    /// End offset stored in a slot (zero if unused).
    pub fn slot(&self, index: usize) -> u32 {
        self.slots[index]
    }

    /// Highest filled slot index, `None` for an empty volume.
    pub fn highest_valid_slot(&self) -> Option<u32> {
        let mut high = None;
        for (i, &slot) in self.slots.iter().enumerate() {
            if slot == 0 {
                break;
            }
            high = Some(i as u32);
        }
        high
    }

    /// Current append offset.
    pub fn end_offset(&self) -> u32 {
        self.offset
    }

    /// Append one framed record and fsync it. Returns the new end offset.
    ///
    /// The slot table is not touched; the caller exposes the record with
    /// `set_slot` once it is durable.
    pub fn append_record(&mut self, line: &[u8]) -> Result<u32> {
        if !self.writable {
            return Err(Error::InvalidOperation(
                "volume opened read-only".to_string(),
            ));
        }
        let mut frame = Vec::with_capacity(line.len() + 8);
        frame.extend_from_slice(&(line.len() as u32).to_le_bytes());
        frame.extend_from_slice(line);
        frame.extend_from_slice(&crc32fast::hash(line).to_le_bytes());

        self.file.seek(SeekFrom::Start(u64::from(self.offset)))?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.offset += frame.len() as u32;
        Ok(self.offset)
    }

    /// Store `offset` in `slot` and fsync the header page.
    pub fn set_slot(&mut self, slot: usize, offset: u32) -> Result<()> {
        if !self.writable {
            return Err(Error::InvalidOperation(
                "volume opened read-only".to_string(),
            ));
        }
        self.slots[slot] = offset;
        let at = 32 + 4 * slot;
        self.file.seek(SeekFrom::Start(at as u64))?;
        self.file.write_all(&offset.to_le_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read the framed records in `[start, end)` as raw lines.
    pub fn read_lines(&mut self, start: u32, end: u32) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        let mut pos = start;
        self.file.seek(SeekFrom::Start(u64::from(start)))?;
        while pos < end {
            let mut len_bytes = [0u8; 4];
            self.file.read_exact(&mut len_bytes).map_err(|_| {
                Error::CorruptWal(format!("truncated WAL record: {}", self.path.display()))
            })?;
            let len = u32::from_le_bytes(len_bytes);
            if pos + 8 + len > end {
                return Err(Error::CorruptWal(format!(
                    "WAL record crosses slot boundary: {}",
                    self.path.display()
                )));
            }
            let mut line = vec![0u8; len as usize];
            self.file.read_exact(&mut line).map_err(|_| {
                Error::CorruptWal(format!("truncated WAL record: {}", self.path.display()))
            })?;
            let mut crc_bytes = [0u8; 4];
            self.file.read_exact(&mut crc_bytes).map_err(|_| {
                Error::CorruptWal(format!("truncated WAL record: {}", self.path.display()))
            })?;
            if crc32fast::hash(&line) != u32::from_le_bytes(crc_bytes) {
                return Err(Error::CorruptWal(format!(
                    "WAL record checksum mismatch: {}",
                    self.path.display()
                )));
            }
            pos += 8 + len;
            lines.push(line);
        }
        Ok(lines)
    }

    /// Base revisions of every volume in `dir`, sorted ascending.
    ///
    /// Quarantined volumes (`wal.<rev>.corrupt*`) do not parse and are
    /// skipped.
    pub fn list_volumes(dir: &Path) -> Result<Vec<u64>> {
        let mut volumes = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(volumes),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(suffix) = name.strip_prefix(WAL_STORAGE_PATH) {
                if let Ok(base) = suffix.parse::<u64>() {
                    volumes.push(base);
                }
            }
        }
        volumes.sort_unstable();
        Ok(volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let uuid = DatabaseUuid::generate();

        let volume = WalVolume::create(dir.path(), 100, uuid).unwrap();
        assert_eq!(volume.base_revision(), 100);
        assert_eq!(volume.end_offset(), STORAGE_START_BLOCK_OFFSET);
        drop(volume);

        let volume = WalVolume::open(dir.path(), 100, false).unwrap();
        assert_eq!(volume.uuid(), uuid);
        assert_eq!(volume.highest_valid_slot(), None);
    }

    #[test]
    fn test_open_missing_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            WalVolume::open(dir.path(), 5, false),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_base_revision_must_match_filename() {
        let dir = tempdir().unwrap();
        let uuid = DatabaseUuid::generate();
        WalVolume::create(dir.path(), 0, uuid).unwrap();

        // Rename the volume so the filename lies about the base revision.
        std::fs::rename(
            WalVolume::volume_path(dir.path(), 0),
            WalVolume::volume_path(dir.path(), 7),
        )
        .unwrap();
        assert!(matches!(
            WalVolume::open(dir.path(), 7, false),
            Err(Error::CorruptWal(_))
        ));
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let uuid = DatabaseUuid::generate();
        let mut volume = WalVolume::create(dir.path(), 0, uuid).unwrap();

        let end1 = volume.append_record(b"first").unwrap();
        volume.set_slot(0, end1).unwrap();
        let end2 = volume.append_record(b"second").unwrap();
        volume.set_slot(1, end2).unwrap();

        let lines = volume
            .read_lines(STORAGE_START_BLOCK_OFFSET, end2)
            .unwrap();
        assert_eq!(lines, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(volume.highest_valid_slot(), Some(1));
    }

    #[test]
    fn test_corrupt_record_detected() {
        let dir = tempdir().unwrap();
        let uuid = DatabaseUuid::generate();
        let mut volume = WalVolume::create(dir.path(), 0, uuid).unwrap();
        let end = volume.append_record(b"payload").unwrap();
        volume.set_slot(0, end).unwrap();
        let path = volume.path().to_path_buf();
        drop(volume);

        // Flip a byte inside the record body.
        let mut bytes = std::fs::read(&path).unwrap();
        let at = STORAGE_START_BLOCK_OFFSET as usize + 5;
        bytes[at] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut volume = WalVolume::open(dir.path(), 0, false).unwrap();
        assert!(matches!(
            volume.read_lines(STORAGE_START_BLOCK_OFFSET, end),
            Err(Error::CorruptWal(_))
        ));
    }

    #[test]
    fn test_reopen_resumes_at_last_slot() {
        let dir = tempdir().unwrap();
        let uuid = DatabaseUuid::generate();
        let mut volume = WalVolume::create(dir.path(), 0, uuid).unwrap();
        let end = volume.append_record(b"one").unwrap();
        volume.set_slot(0, end).unwrap();
        drop(volume);

        let volume = WalVolume::open(dir.path(), 0, true).unwrap();
        assert_eq!(volume.end_offset(), end);
    }

    #[test]
    fn test_list_volumes_skips_quarantined() {
        let dir = tempdir().unwrap();
        let uuid = DatabaseUuid::generate();
        WalVolume::create(dir.path(), 0, uuid).unwrap();
        WalVolume::create(dir.path(), 4096, uuid).unwrap();
        std::fs::write(dir.path().join("wal.200.corrupt"), b"parked").unwrap();
        std::fs::write(dir.path().join("unrelated"), b"x").unwrap();

        assert_eq!(WalVolume::list_volumes(dir.path()).unwrap(), vec![0, 4096]);
    }

    #[test]
    fn test_list_volumes_missing_dir() {
        let dir = tempdir().unwrap();
        let volumes = WalVolume::list_volumes(&dir.path().join("absent")).unwrap();
        assert!(volumes.is_empty());
    }

    proptest! {
        #[test]
        fn prop_filled_slots_form_prefix(fill in 0usize..20) {
            let dir = tempdir().unwrap();
            let uuid = DatabaseUuid::generate();
            let mut volume = WalVolume::create(dir.path(), 0, uuid).unwrap();
            for i in 0..fill {
                let end = volume.append_record(format!("line-{i}").as_bytes()).unwrap();
                volume.set_slot(i, end).unwrap();
            }
            drop(volume);

            let volume = WalVolume::open(dir.path(), 0, false).unwrap();
            match volume.highest_valid_slot() {
                None => prop_assert_eq!(fill, 0),
                Some(high) => {
                    prop_assert_eq!(high as usize, fill - 1);
                    for i in 0..fill {
                        prop_assert!(volume.slot(i) != 0);
                    }
                    prop_assert_eq!(volume.slot(fill), 0);
                }
            }
        }
    }
}
