use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::{unpoison, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// At most one destructive operation per target connection. Taking a lock
/// never waits: a held target is [`Error::Busy`].
#[derive(Clone, Debug, Default)]
pub struct TargetLocks {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

/// Releases its targets when dropped.
#[derive(Debug)]
pub struct TargetGuard {
    held: Arc<Mutex<HashSet<Uuid>>>,
    ids: Vec<Uuid>,
}

impl TargetLocks {
    pub fn try_lock(&self, id: Uuid, label: &str) -> Result<TargetGuard> {
        self.try_lock_all(&[(id, label)])
    }

    /// Locks every target or none of them.
    pub fn try_lock_all(&self, targets: &[(Uuid, &str)]) -> Result<TargetGuard> {
        let mut held = unpoison(self.held.lock(), "target locks")?;
        if let Some((_, label)) = targets.iter().find(|(id, _)| held.contains(id)) {
            return Err(Error::busy(*label));
        }
        let mut ids = vec![];
        for (id, _) in targets {
            if held.insert(*id) {
                ids.push(*id);
            }
        }
        Ok(TargetGuard {
            held: self.held.clone(),
            ids,
        })
    }

    pub fn is_locked(&self, id: Uuid) -> Result<bool> {
        Ok(unpoison(self.held.lock(), "target locks")?.contains(&id))
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        match self.held.lock() {
            Ok(mut held) => self.ids.iter().for_each(|id| {
                held.remove(id);
            }),
            Err(e) => tracing::error!("Releasing target locks {:?} failed: {}", self.ids, e),
        }
    }
}
