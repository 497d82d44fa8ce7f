use crate::error::{Error, Result};

/// One-byte start control at row offset 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartControl {
    /// `T`: the row opens a transaction.
    TransactionStart,
    /// `R`: the row continues an open transaction.
    Continuation,
    /// `C`: checksum row.
    Checksum,
}

impl StartControl {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::TransactionStart => b'T',
            Self::Continuation => b'R',
            Self::Checksum => b'C',
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'T' => Ok(Self::TransactionStart),
            b'R' => Ok(Self::Continuation),
            b'C' => Ok(Self::Checksum),
            _ => Err(Error::corrupt(format!("invalid start control {b:#04x}"))),
        }
    }
}

/// Two-byte end control at row offset `R-5..R-3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndControl {
    /// `TC`: commit.
    Commit,
    /// `RE`: row end, transaction continues.
    RowEnd,
    /// `SC`: savepoint on this row, then commit.
    SavepointCommit,
    /// `SE`: savepoint on this row, transaction continues.
    SavepointRowEnd,
    /// `R0`..`R9`: rollback to savepoint n (0 = everything).
    Rollback(u8),
    /// `S0`..`S9`: savepoint on this row, then rollback to savepoint n.
    SavepointRollback(u8),
    /// `CS`: checksum row terminator.
    ChecksumSeal,
    /// `NR`: null row terminator.
    NullRow,
}

impl EndControl {
    pub fn as_bytes(self) -> [u8; 2] {
        match self {
            Self::Commit => *b"TC",
            Self::RowEnd => *b"RE",
            Self::SavepointCommit => *b"SC",
            Self::SavepointRowEnd => *b"SE",
            Self::Rollback(n) => [b'R', b'0' + n],
            Self::SavepointRollback(n) => [b'S', b'0' + n],
            Self::ChecksumSeal => *b"CS",
            Self::NullRow => *b"NR",
        }
    }

    pub fn from_bytes(b: [u8; 2]) -> Result<Self> {
        match &b {
            b"TC" => Ok(Self::Commit),
            b"RE" => Ok(Self::RowEnd),
            b"SC" => Ok(Self::SavepointCommit),
            b"SE" => Ok(Self::SavepointRowEnd),
            b"CS" => Ok(Self::ChecksumSeal),
            b"NR" => Ok(Self::NullRow),
            [b'R', n @ b'0'..=b'9'] => Ok(Self::Rollback(n - b'0')),
            [b'S', n @ b'0'..=b'9'] => Ok(Self::SavepointRollback(n - b'0')),
            _ => Err(Error::corrupt(format!(
                "invalid end control {:#04x}{:#04x}",
                b[0], b[1]
            ))),
        }
    }

    /// True when this end control closes its transaction.
    pub fn is_terminating(self) -> bool {
        !matches!(self, Self::RowEnd | Self::SavepointRowEnd)
    }

    /// True when the row carrying this end control declares a savepoint.
    /// Savepoint IDs are positional: the n-th such row in a transaction is
    /// savepoint n.
    pub fn marks_savepoint(self) -> bool {
        matches!(
            self,
            Self::SavepointCommit | Self::SavepointRowEnd | Self::SavepointRollback(_)
        )
    }

    /// `Some(n)` when this end control rolls the transaction back to
    /// savepoint n.
    pub fn rollback_target(self) -> Option<u8> {
        match self {
            Self::Rollback(n) | Self::SavepointRollback(n) => Some(n),
            _ => None,
        }
    }
}
