//! Open-flags bit set.
//!
//! The flags are part of the public contract of the pool; consumers combine
//! bits with `|`. The default is `OPEN`.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Open flags for shard checkout.
///
/// | Flag | Effect |
/// |------|--------|
/// | `OPEN` | Open existing database; fail if absent |
/// | `CREATE_OR_OPEN` | Create if missing, else open |
/// | `WRITABLE` | Request the writable slot; one grantable per endpoint |
/// | `NO_WAL` | Do not produce WAL records for this handle's writes |
/// | `SYNC_WAL` | Synchronous WAL writes on the caller thread |
/// | `NOSTORAGE` | Disable blob/external-storage side files |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u32);

impl Flags {
    /// Open an existing database; fail if absent.
    pub const OPEN: Flags = Flags(0x0000);
    /// Automatically create the database if it doesn't exist.
    pub const CREATE_OR_OPEN: Flags = Flags(0x0001);
    /// Open as writable.
    pub const WRITABLE: Flags = Flags(0x0002);
    /// Disable WAL records for this handle's writes.
    pub const NO_WAL: Flags = Flags(0x0010);
    /// Force synchronous WAL writes on the caller thread.
    pub const SYNC_WAL: Flags = Flags(0x0020);
    /// Disable the separate data storage side file.
    pub const NOSTORAGE: Flags = Flags(0x0040);

    /// Raw bit value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Construct from a raw bit value.
    pub fn from_bits(bits: u32) -> Flags {
        Flags(bits)
    }

    /// Check whether all bits of `other` are set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the writable slot is requested.
    pub fn is_writable(self) -> bool {
        self.contains(Flags::WRITABLE)
    }

    /// Whether writes on this handle produce WAL records.
    pub fn wal_active(self) -> bool {
        self.is_writable() && !self.contains(Flags::NO_WAL)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Flags::CREATE_OR_OPEN) {
            names.push("CREATE_OR_OPEN");
        }
        if self.contains(Flags::WRITABLE) {
            names.push("WRITABLE");
        }
        if self.contains(Flags::NO_WAL) {
            names.push("NO_WAL");
        }
        if self.contains(Flags::SYNC_WAL) {
            names.push("SYNC_WAL");
        }
        if self.contains(Flags::NOSTORAGE) {
            names.push("NOSTORAGE");
        }
        if names.is_empty() {
            names.push("OPEN");
        }
        write!(f, "{}", names.join("|"))
    }
}
