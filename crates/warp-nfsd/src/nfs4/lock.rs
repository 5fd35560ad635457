//! Byte-range lock table
//!
//! One [`LockTable`] per managed file. Locks follow POSIX record-lock rules:
//! a new lock from an owner replaces whatever that owner held over the same
//! bytes, adjacent locks of one owner and type coalesce, and unlocking the
//! middle of a lock splits it.

use super::tables::OwnerId;
use crate::error::{NfsStatus, StatusResult};

/// Lock type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockType {
    /// Read lock
    ReadLt = 1,
    /// Write lock
    WriteLt = 2,
    /// Read lock with wait
    ReadW = 3,
    /// Write lock with wait
    WriteW = 4,
}

impl TryFrom<u32> for LockType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ReadLt),
            2 => Ok(Self::WriteLt),
            3 => Ok(Self::ReadW),
            4 => Ok(Self::WriteW),
            _ => Err(NfsStatus::Inval),
        }
    }
}

impl LockType {
    /// Check if this is a write lock
    pub fn is_write(&self) -> bool {
        matches!(self, Self::WriteLt | Self::WriteW)
    }

    /// Check if this lock should block
    pub fn should_wait(&self) -> bool {
        matches!(self, Self::ReadW | Self::WriteW)
    }
}

/// Locked byte range, `end` exclusive; `u64::MAX` means end of file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSpan {
    /// First byte
    pub start: u64,
    /// One past the last byte
    pub end: u64,
}

impl LockSpan {
    /// Validate an NFSv4 (offset, length) pair
    ///
    /// A length of `u64::MAX` locks to end of file; zero length or a range
    /// running past the largest offset is invalid.
    pub fn from_wire(offset: u64, length: u64) -> StatusResult<Self> {
        if length == 0 {
            return Err(NfsStatus::Inval);
        }
        if length == u64::MAX {
            return Ok(Self {
                start: offset,
                end: u64::MAX,
            });
        }
        let end = offset.checked_add(length).ok_or(NfsStatus::Inval)?;
        Ok(Self { start: offset, end })
    }

    /// Wire length of the span
    pub fn length(&self) -> u64 {
        if self.end == u64::MAX {
            u64::MAX
        } else {
            self.end - self.start
        }
    }

    fn overlaps(&self, other: &LockSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One held lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteRangeLock {
    pub owner: OwnerId,
    pub write: bool,
    pub span: LockSpan,
}

impl ByteRangeLock {
    fn conflicts_with(&self, owner: OwnerId, span: &LockSpan, write: bool) -> bool {
        self.owner != owner && self.span.overlaps(span) && (self.write || write)
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: Vec<ByteRangeLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self { locks: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// First lock held by another owner that conflicts with the request
    pub fn find_conflict(&self, owner: OwnerId, span: &LockSpan, write: bool) -> Option<ByteRangeLock> {
        self.locks
            .iter()
            .find(|l| l.conflicts_with(owner, span, write))
            .copied()
    }

    /// Acquire a lock, or return the lock that blocks it
    pub fn lock(&mut self, owner: OwnerId, span: LockSpan, write: bool) -> Result<(), ByteRangeLock> {
        if let Some(conflict) = self.find_conflict(owner, &span, write) {
            return Err(conflict);
        }
        self.carve(owner, &span);

        let mut merged = ByteRangeLock { owner, write, span };
        loop {
            let neighbour = self.locks.iter().position(|l| {
                l.owner == owner
                    && l.write == write
                    && l.span.start <= merged.span.end
                    && merged.span.start <= l.span.end
            });
            match neighbour {
                Some(index) => {
                    let absorbed = self.locks.swap_remove(index);
                    merged.span.start = merged.span.start.min(absorbed.span.start);
                    merged.span.end = merged.span.end.max(absorbed.span.end);
                }
                None => break,
            }
        }
        self.locks.push(merged);
        self.locks.sort_by_key(|l| (l.span.start, l.owner));
        Ok(())
    }

    /// Release an owner's locks over a span
    pub fn unlock(&mut self, owner: OwnerId, span: LockSpan) {
        self.carve(owner, &span);
    }

    /// Whether an owner holds any lock
    pub fn owner_holds(&self, owner: OwnerId) -> bool {
        self.locks.iter().any(|l| l.owner == owner)
    }

    /// Drop every lock of an owner
    pub fn release_owner(&mut self, owner: OwnerId) {
        self.locks.retain(|l| l.owner != owner);
    }

    /// Remove the owner's coverage of `span`, splitting locks that straddle it
    fn carve(&mut self, owner: OwnerId, span: &LockSpan) {
        let mut kept = Vec::with_capacity(self.locks.len() + 1);
        for lock in self.locks.drain(..) {
            if lock.owner != owner || !lock.span.overlaps(span) {
                kept.push(lock);
                continue;
            }
            if lock.span.start < span.start {
                kept.push(ByteRangeLock {
                    span: LockSpan {
                        start: lock.span.start,
                        end: span.start,
                    },
                    ..lock
                });
            }
            if span.end < lock.span.end {
                kept.push(ByteRangeLock {
                    span: LockSpan {
                        start: span.end,
                        end: lock.span.end,
                    },
                    ..lock
                });
            }
        }
        self.locks = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(offset: u64, length: u64) -> LockSpan {
        LockSpan::from_wire(offset, length).unwrap()
    }

    #[test]
    fn test_lock_type() {
        assert!(LockType::WriteLt.is_write());
        assert!(!LockType::ReadLt.is_write());
        assert!(LockType::ReadW.should_wait());
        assert!(!LockType::ReadLt.should_wait());
        assert!(LockType::try_from(9).is_err());
    }

    #[test]
    fn test_span_validation() {
        assert_eq!(LockSpan::from_wire(0, 0), Err(NfsStatus::Inval));
        assert_eq!(LockSpan::from_wire(u64::MAX - 1, 10), Err(NfsStatus::Inval));
        assert_eq!(span(10, u64::MAX).end, u64::MAX);
        assert_eq!(span(10, u64::MAX).length(), u64::MAX);
        assert_eq!(span(10, 5).length(), 5);
    }

    #[test]
    fn test_shared_locks_coexist() {
        let mut table = LockTable::new();
        table.lock(1, span(0, 100), false).unwrap();
        table.lock(2, span(50, 100), false).unwrap();
        let conflict = table.lock(3, span(75, 10), true).unwrap_err();
        assert!(conflict.owner == 1 || conflict.owner == 2);
    }

    #[test]
    fn test_same_owner_never_conflicts() {
        let mut table = LockTable::new();
        table.lock(1, span(0, 100), true).unwrap();
        table.lock(1, span(50, 100), false).unwrap();
        assert!(table.find_conflict(2, &span(0, 50), false).is_some());
        assert!(table.find_conflict(2, &span(50, 100), false).is_none());
    }

    #[test]
    fn test_unlock_splits() {
        let mut table = LockTable::new();
        table.lock(1, span(0, 100), true).unwrap();
        table.unlock(1, span(40, 20));
        assert!(table.find_conflict(2, &span(40, 20), true).is_none());
        assert!(table.find_conflict(2, &span(0, 10), true).is_some());
        assert!(table.find_conflict(2, &span(90, 10), true).is_some());

        table.unlock(1, span(0, u64::MAX));
        assert!(table.is_empty());
    }

    #[test]
    fn test_adjacent_locks_coalesce() {
        let mut table = LockTable::new();
        table.lock(1, span(0, 10), true).unwrap();
        table.lock(1, span(10, 10), true).unwrap();
        assert_eq!(table.locks.len(), 1);
        assert_eq!(table.locks[0].span, span(0, 20));
    }
}
