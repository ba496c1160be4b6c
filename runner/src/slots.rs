use crate::sync::{LockGuard, SharedDocument, SyncError};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, info};

/// serialized set of claimed slots
pub const REGISTRY_FILE: &str = ".top";
/// lock file guarding `REGISTRY_FILE`, independent from the queue lock
pub const REGISTRY_LOCK: &str = ".top.lck";

/// Lock file a generation holds on its slot for as long as it lives.
///
/// A claim in `REGISTRY_FILE` only says a chain should go on, this lock says a process is
/// actually working on the slot right now. The kernel drops it when that process dies.
pub fn live_lock_name(slot: &SlotId) -> String {
    format!(".slot-{slot}.lck")
}

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("GPU line {0} is busy")]
    Busy(SlotId),
    #[error("Invalid slot id '{0}'")]
    InvalidSlotId(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// One exclusive hardware unit, e.g. the index of an accelerator
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(id: impl Into<String>) -> Result<Self, SlotError> {
        let id: String = id.into();
        let id = id.trim().to_owned();

        if id.is_empty()
            || id.starts_with('.')
            || id.contains(std::path::is_separator)
            || id.contains(char::is_whitespace)
        {
            Err(SlotError::InvalidSlotId(id))
        } else {
            Ok(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SlotId {
    type Err = SlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

pub type SlotSet = BTreeSet<SlotId>;

/// Registry of slots that currently have a live chain of generations
#[derive(Debug, Clone)]
pub struct SlotRegistry {
    base: PathBuf,
    document: SharedDocument<SlotSet>,
}

impl SlotRegistry {
    pub fn open(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            document: SharedDocument::new(base.join(REGISTRY_FILE), base.join(REGISTRY_LOCK)),
        }
    }

    /// Mark the calling process as alive on `slot` until the guard is dropped.
    ///
    /// Waits while another process still holds the slot, e.g. a parent generation that has
    /// not exited yet.
    pub fn hold(&self, slot: &SlotId) -> Result<LockGuard, SlotError> {
        Ok(LockGuard::acquire(self.base.join(live_lock_name(slot)))?)
    }

    /// Slots out of `slots` no process is alive on, each returned with its liveness lock held.
    ///
    /// Never waits, a slot whose lock is taken is simply left out.
    pub fn idle<'a>(
        &self,
        slots: impl IntoIterator<Item = &'a SlotId>,
    ) -> Result<BTreeMap<SlotId, LockGuard>, SlotError> {
        let mut idle = BTreeMap::new();

        for slot in slots {
            if idle.contains_key(slot) {
                continue;
            }

            match LockGuard::try_acquire(self.base.join(live_lock_name(slot)))? {
                Some(guard) => {
                    idle.insert(slot.clone(), guard);
                }
                None => debug!(slot = %slot, "A generation is alive on the slot"),
            }
        }

        Ok(idle)
    }

    /// Mark `slot` as owned by a new chain, fails if another chain owns it
    pub fn claim(&self, slot: &SlotId) -> Result<(), SlotError> {
        self.document.update_or_init(SlotSet::new, |slots| {
            if slots.insert(slot.clone()) {
                info!(slot = %slot, "Claimed slot");

                Ok(())
            } else {
                Err(SlotError::Busy(slot.clone()))
            }
        })
    }

    pub fn is_claimed(&self, slot: &SlotId) -> Result<bool, SlotError> {
        match self.document.read() {
            Ok(slots) => Ok(slots.contains(slot)),
            Err(SyncError::DocumentNotFound(_)) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Remove `slot`, releasing an unclaimed slot is not an error
    pub fn release(&self, slot: &SlotId) -> Result<(), SlotError> {
        let result = self.document.update(|slots| {
            if slots.remove(slot) {
                info!(slot = %slot, "Released slot");
            } else {
                debug!(slot = %slot, "Slot was not claimed");
            }

            Ok::<(), SlotError>(())
        });

        match result {
            Err(SlotError::Sync(SyncError::DocumentNotFound(_))) => {
                debug!(slot = %slot, "No slot registry yet, nothing to release");

                Ok(())
            }
            result => result,
        }
    }

    pub fn claimed(&self) -> Result<SlotSet, SlotError> {
        match self.document.read() {
            Ok(slots) => Ok(slots),
            Err(SyncError::DocumentNotFound(_)) => Ok(SlotSet::new()),
            Err(error) => Err(error.into()),
        }
    }
}
