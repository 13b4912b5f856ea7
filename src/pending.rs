//! Pending-operation flags.
//!
//! Each product and category carries a small set of flags naming the remote
//! writes that have not been confirmed yet. The flags are persisted as an
//! integer bitmask (`0x1` create, `0x2` update, `0x4` quantity) and are only
//! ever raised or cleared with masked SQL, so a flag raised by one path is
//! never lost because another path cleared a different one.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SyncError};
use crate::models::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PendingOps {
    pub create: bool,
    pub update: bool,
    pub quantity: bool,
}

impl PendingOps {
    pub const NONE: PendingOps = PendingOps {
        create: false,
        update: false,
        quantity: false,
    };
    pub const CREATE: PendingOps = PendingOps {
        create: true,
        update: false,
        quantity: false,
    };
    pub const UPDATE: PendingOps = PendingOps {
        create: false,
        update: true,
        quantity: false,
    };
    pub const QUANTITY: PendingOps = PendingOps {
        create: false,
        update: false,
        quantity: true,
    };

    const CREATE_BIT: i64 = 0x1;
    const UPDATE_BIT: i64 = 0x2;
    const QUANTITY_BIT: i64 = 0x4;

    pub fn bits(self) -> i64 {
        let mut bits = 0;
        if self.create {
            bits |= Self::CREATE_BIT;
        }
        if self.update {
            bits |= Self::UPDATE_BIT;
        }
        if self.quantity {
            bits |= Self::QUANTITY_BIT;
        }
        bits
    }

    /// Unknown high bits are ignored.
    pub fn from_bits(bits: i64) -> Self {
        Self {
            create: bits & Self::CREATE_BIT != 0,
            update: bits & Self::UPDATE_BIT != 0,
            quantity: bits & Self::QUANTITY_BIT != 0,
        }
    }

    pub fn is_empty(self) -> bool {
        self.bits() == 0
    }

    pub fn contains(self, other: PendingOps) -> bool {
        self.bits() & other.bits() == other.bits()
    }

    pub fn union(self, other: PendingOps) -> Self {
        Self::from_bits(self.bits() | other.bits())
    }

    pub fn without(self, other: PendingOps) -> Self {
        Self::from_bits(self.bits() & !other.bits())
    }
}

impl std::fmt::Display for PendingOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.create {
            names.push("create");
        }
        if self.update {
            names.push("update");
        }
        if self.quantity {
            names.push("quantity");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("+"))
        }
    }
}

/// Raise `flags` on an entity, leaving the other flags untouched.
pub fn set(conn: &Connection, kind: EntityKind, id: i64, flags: PendingOps) -> Result<()> {
    let sql = format!("UPDATE {} SET pending = pending | ?1 WHERE id = ?2", kind.table());
    let changed = conn.execute(&sql, params![flags.bits(), id])?;
    if changed == 0 {
        return Err(SyncError::NotFound {
            kind: kind.as_str(),
            id,
        });
    }
    Ok(())
}

/// Clear `mask` on an entity, leaving the other flags untouched.
///
/// Clearing flags on an entity that no longer exists is a no-op: the entity
/// may have been deleted while its request was in flight.
pub fn clear(conn: &Connection, kind: EntityKind, id: i64, mask: PendingOps) -> Result<()> {
    let sql = format!("UPDATE {} SET pending = pending & ~?1 WHERE id = ?2", kind.table());
    conn.execute(&sql, params![mask.bits(), id])?;
    Ok(())
}

pub fn get(conn: &Connection, kind: EntityKind, id: i64) -> Result<PendingOps> {
    let sql = format!("SELECT pending FROM {} WHERE id = ?1", kind.table());
    let bits: Option<i64> = conn
        .query_row(&sql, params![id], |row| row.get(0))
        .optional()?;
    bits.map(PendingOps::from_bits).ok_or(SyncError::NotFound {
        kind: kind.as_str(),
        id,
    })
}
