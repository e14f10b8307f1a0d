//! Quota accounting contract and an in-memory ledger

use crate::error::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaId {
    User(u32),
    Group(u32),
}

/// Where block usage is charged
pub trait QuotaSink: Send + Sync {
    /// Fail with `QuotaExceeded` if `blocks` more would exceed a limit
    fn check(&self, uid: u32, gid: u32, blocks: u64) -> Result<()>;

    /// Add `change` blocks (negative to release) to the owner's usage
    fn charge(&self, uid: u32, gid: u32, change: i64);
}

/// Per-owner usage with optional hard limits
#[derive(Default)]
pub struct QuotaLedger {
    usage: Mutex<HashMap<QuotaId, i64>>,
    limits: Mutex<HashMap<QuotaId, u64>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_limit(&self, id: QuotaId, blocks: u64) {
        self.limits.lock().insert(id, blocks);
    }

    pub fn usage(&self, id: QuotaId) -> i64 {
        self.usage.lock().get(&id).copied().unwrap_or(0)
    }
}

impl QuotaSink for QuotaLedger {
    fn check(&self, uid: u32, gid: u32, blocks: u64) -> Result<()> {
        let limits = self.limits.lock();
        let usage = self.usage.lock();
        for id in [QuotaId::User(uid), QuotaId::Group(gid)] {
            if let Some(&limit) = limits.get(&id) {
                let used = usage.get(&id).copied().unwrap_or(0).max(0) as u64;
                if used + blocks > limit {
                    debug!("quota {:?}: {} + {} exceeds {}", id, used, blocks, limit);
                    return Err(Error::QuotaExceeded);
                }
            }
        }
        Ok(())
    }

    fn charge(&self, uid: u32, gid: u32, change: i64) {
        let mut usage = self.usage.lock();
        *usage.entry(QuotaId::User(uid)).or_insert(0) += change;
        *usage.entry(QuotaId::Group(gid)).or_insert(0) += change;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_and_release() {
        let ledger = QuotaLedger::new();
        ledger.charge(1000, 100, 5);
        ledger.charge(1000, 100, -2);
        assert_eq!(ledger.usage(QuotaId::User(1000)), 3);
        assert_eq!(ledger.usage(QuotaId::Group(100)), 3);
        assert_eq!(ledger.usage(QuotaId::User(0)), 0);
    }

    #[test]
    fn test_limit_enforced() {
        let ledger = QuotaLedger::new();
        ledger.set_limit(QuotaId::Group(7), 4);
        ledger.charge(1, 7, 3);
        assert!(ledger.check(1, 7, 1).is_ok());
        assert!(matches!(ledger.check(1, 7, 2), Err(Error::QuotaExceeded)));
        // no limit for the user id
        assert!(ledger.check(1, 8, 100).is_ok());
    }
}
