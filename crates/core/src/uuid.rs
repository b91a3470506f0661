//! Database identity.
//!
//! Every database is stamped with a 16-byte UUID at creation. Historical
//! on-disk headers stored the identity in either native or little-endian
//! field order, so comparisons must accept both representations.

use std::fmt;

/// 16-byte database identity.
///
/// The identity is generated once at database creation and never changes.
/// The pair `(uuid, revision)` uniquely identifies a database state.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatabaseUuid {
    bytes: [u8; 16],
}

impl DatabaseUuid {
    /// The all-zero identity, used before a database has been stamped.
    pub const NIL: DatabaseUuid = DatabaseUuid { bytes: [0u8; 16] };

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        DatabaseUuid {
            bytes: *uuid::Uuid::new_v4().as_bytes(),
        }
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        DatabaseUuid { bytes }
    }

    /// Raw bytes of the identity.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// Check whether this is the all-zero identity.
    pub fn is_nil(&self) -> bool {
        self.bytes == [0u8; 16]
    }

    /// The little-endian twin of this identity.
    ///
    /// Headers written on platforms that stored UUID fields in native order
    /// swap the first three fields (4, 2 and 2 bytes).
    pub fn swapped(&self) -> DatabaseUuid {
        let b = &self.bytes;
        DatabaseUuid {
            bytes: [
                b[3], b[2], b[1], b[0], // time_low
                b[5], b[4], // time_mid
                b[7], b[6], // time_hi_and_version
                b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
            ],
        }
    }

    /// Compare against another identity in either byte order.
    pub fn matches(&self, other: &DatabaseUuid) -> bool {
        *self == *other || self.swapped() == *other
    }
}

impl fmt::Display for DatabaseUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.bytes).hyphenated())
    }
}

impl fmt::Debug for DatabaseUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseUuid({})", self)
    }
}
