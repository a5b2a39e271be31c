use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per contract or invoice id, so operations on the same
/// entity run one at a time inside this process. Cross-process races are
/// caught by the store's version check.
#[derive(Debug, Default)]
pub(crate) struct EntityLocks {
    slots: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub(crate) async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            if slots.len() >= PRUNE_THRESHOLD {
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(id).or_default().clone()
        };
        slot.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_waits_and_other_ids_do_not() {
        let locks = Arc::new(EntityLocks::default());
        let a = Uuid::new_v4();
        let held = locks.acquire(a).await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire(Uuid::new_v4())).await;
        assert!(other.is_ok());

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(a)).await;
        assert!(blocked.is_err());

        drop(held);
        assert!(tokio::time::timeout(Duration::from_millis(50), locks.acquire(a)).await.is_ok());
    }
}
