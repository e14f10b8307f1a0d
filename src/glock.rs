//! Lock manager contract and the in-process implementation
//!
//! Every lock carries a generation number that moves forward each time an
//! exclusive holder lets go. Holders compare it against the version they
//! last loaded to decide whether cached state must be rebuilt.

use crate::error::Result;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lockable objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockName {
    /// The resource index special file
    Rindex,
    /// A resource group, by header address
    Rgrp(u64),
    /// An inode, by dinode address
    Inode(u64),
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockName::Rindex => write!(f, "rindex"),
            LockName::Rgrp(addr) => write!(f, "rgrp:{}", addr),
            LockName::Inode(addr) => write!(f, "inode:{}", addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Granted,
    /// A non-blocking request found the lock busy
    TryFailed,
}

/// Cluster-wide lock service
pub trait LockManager: Send + Sync {
    /// Acquire `name` in `mode`. With `try_lock` set, a busy lock returns
    /// `TryFailed` instead of waiting.
    fn lock(&self, name: LockName, mode: LockMode, try_lock: bool) -> Result<LockStatus>;

    fn unlock(&self, name: LockName, mode: LockMode);

    /// Current generation of a lock
    fn generation(&self, name: LockName) -> u64;
}

#[derive(Debug)]
struct LockState {
    shared: u32,
    exclusive: bool,
    generation: u64,
}

impl Default for LockState {
    fn default() -> Self {
        LockState {
            shared: 0,
            exclusive: false,
            generation: 1,
        }
    }
}

impl LockState {
    fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.exclusive,
            LockMode::Exclusive => !self.exclusive && self.shared == 0,
        }
    }
}

/// Lock manager for holders that live in one process
#[derive(Default)]
pub struct LocalLockManager {
    locks: Mutex<HashMap<LockName, LockState>>,
    released: Condvar,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for LocalLockManager {
    fn lock(&self, name: LockName, mode: LockMode, try_lock: bool) -> Result<LockStatus> {
        let mut locks = self.locks.lock();
        loop {
            let state = locks.entry(name).or_default();
            if state.compatible(mode) {
                match mode {
                    LockMode::Shared => state.shared += 1,
                    LockMode::Exclusive => state.exclusive = true,
                }
                trace!("lock {} {:?} granted", name, mode);
                return Ok(LockStatus::Granted);
            }
            if try_lock {
                return Ok(LockStatus::TryFailed);
            }
            self.released.wait(&mut locks);
        }
    }

    fn unlock(&self, name: LockName, mode: LockMode) {
        let mut locks = self.locks.lock();
        let state = locks.entry(name).or_default();
        match mode {
            LockMode::Shared => state.shared = state.shared.saturating_sub(1),
            LockMode::Exclusive => {
                state.exclusive = false;
                state.generation += 1;
            }
        }
        trace!("lock {} {:?} released", name, mode);
        self.released.notify_all();
    }

    fn generation(&self, name: LockName) -> u64 {
        self.locks
            .lock()
            .get(&name)
            .map(|s| s.generation)
            .unwrap_or(1)
    }
}

/// A granted lock, released on drop
pub struct LockHolder {
    lm: Arc<dyn LockManager>,
    name: LockName,
    mode: LockMode,
}

impl LockHolder {
    pub fn name(&self) -> LockName {
        self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Generation of the lock while it is held
    pub fn generation(&self) -> u64 {
        self.lm.generation(self.name)
    }
}

impl Drop for LockHolder {
    fn drop(&mut self) {
        self.lm.unlock(self.name, self.mode);
    }
}

impl fmt::Debug for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHolder")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Acquire a lock, waiting for it if necessary
pub fn acquire(lm: &Arc<dyn LockManager>, name: LockName, mode: LockMode) -> Result<LockHolder> {
    lm.lock(name, mode, false)?;
    Ok(LockHolder {
        lm: Arc::clone(lm),
        name,
        mode,
    })
}

/// Acquire a lock only if it is free right now
pub fn try_acquire(
    lm: &Arc<dyn LockManager>,
    name: LockName,
    mode: LockMode,
) -> Result<Option<LockHolder>> {
    match lm.lock(name, mode, true)? {
        LockStatus::Granted => Ok(Some(LockHolder {
            lm: Arc::clone(lm),
            name,
            mode,
        })),
        LockStatus::TryFailed => Ok(None),
    }
}

/// Acquire several locks in a global order so concurrent callers cannot
/// deadlock against each other
pub fn acquire_many(
    lm: &Arc<dyn LockManager>,
    names: &[LockName],
    mode: LockMode,
) -> Result<Vec<LockHolder>> {
    let mut sorted = names.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
        .into_iter()
        .map(|name| acquire(lm, name, mode))
        .collect()
}
