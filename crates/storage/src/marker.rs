//! The `iamglass` marker file.
//!
//! The marker stamps a database directory with its identity and committed
//! revision. It is written last during a commit, so a directory whose
//! tables and marker disagree is never observable after a crash: the
//! marker still names the previous revision and the tables for it are
//! still in place (table files are replaced atomically).

use meridian_core::{DatabaseUuid, Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes identifying a marker file.
pub const MARKER_MAGIC: [u8; 4] = *b"MGLS";

/// Current marker format version.
pub const MARKER_VERSION: u32 = 1;

/// Marker file size in bytes.
pub const MARKER_SIZE: usize = 32;

/// Parsed marker contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    /// Database identity stamped at creation.
    pub uuid: DatabaseUuid,
    /// Last committed revision.
    pub revision: u64,
}

impl Marker {
    /// Serialise to the fixed on-disk form.
    pub fn to_bytes(&self) -> [u8; MARKER_SIZE] {
        let mut bytes = [0u8; MARKER_SIZE];
        bytes[0..4].copy_from_slice(&MARKER_MAGIC);
        bytes[4..8].copy_from_slice(&MARKER_VERSION.to_le_bytes());
        bytes[8..24].copy_from_slice(self.uuid.as_bytes());
        bytes[24..32].copy_from_slice(&self.revision.to_le_bytes());
        bytes
    }

    /// Parse from on-disk bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Marker> {
        if bytes.len() < MARKER_SIZE {
            return Err(Error::Corrupt("marker file truncated".to_string()));
        }
        if bytes[0..4] != MARKER_MAGIC {
            return Err(Error::Corrupt("bad marker magic".to_string()));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != MARKER_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported marker version {version}"
            )));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[8..24]);
        let revision = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        Ok(Marker {
            uuid: DatabaseUuid::from_bytes(uuid),
            revision,
        })
    }

    /// Read the marker from a file, `None` if the file is absent.
    pub fn read(path: &Path) -> Result<Option<Marker>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = [0u8; MARKER_SIZE];
        file.read_exact(&mut bytes)
            .map_err(|_| Error::Corrupt("marker file truncated".to_string()))?;
        Ok(Some(Marker::from_bytes(&bytes)?))
    }

    /// Write the marker atomically (temp file, fsync, rename).
    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes())
    }
}

/// Replace `path` atomically with `bytes`: write a sibling temp file,
/// fsync it, rename over the target, fsync the directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidOperation(format!("no parent directory: {}", path.display())))?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    File::open(dir)?.sync_all()?;
    Ok(())
}
