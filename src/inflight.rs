//! Acquire-or-await registry for in-progress work keyed by `K`.
//! The first caller for a key becomes the leader and runs the work; callers
//! arriving while it runs become followers and await the leader's result.
//! The slot is released when the leader completes or is dropped, so a
//! leader that fails or is cancelled never strands its followers.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

pub struct InFlight<K, V> {
    slots: Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
}

pub enum Acquired<K: Eq + Hash + Clone, V: Clone> {
    Leader(LeaderGuard<K, V>),
    Follower(Follower<V>),
}

impl<K: Eq + Hash + Clone, V: Clone> InFlight<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(self: &Arc<Self>, key: K) -> Acquired<K, V> {
        let mut slots = self.slots.lock();
        if let Some(rx) = slots.get(&key) {
            return Acquired::Follower(Follower { rx: rx.clone() });
        }
        let (tx, rx) = watch::channel(None);
        slots.insert(key.clone(), rx);
        Acquired::Leader(LeaderGuard {
            registry: Arc::clone(self),
            key,
            tx,
        })
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }

    fn release(&self, key: &K) {
        self.slots.lock().remove(key);
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for InFlight<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by the caller running the work. Dropping it without `complete`
/// releases the slot; followers then see no result.
pub struct LeaderGuard<K: Eq + Hash + Clone, V: Clone> {
    registry: Arc<InFlight<K, V>>,
    key: K,
    tx: watch::Sender<Option<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LeaderGuard<K, V> {
    /// Publish the result to followers and release the slot.
    pub fn complete(self, value: V) {
        self.tx.send_replace(Some(value));
        // Drop releases the slot
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for LeaderGuard<K, V> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

pub struct Follower<V: Clone> {
    rx: watch::Receiver<Option<V>>,
}

impl<V: Clone> Follower<V> {
    /// Wait for the leader. `None` if the leader gave up without a result.
    pub async fn wait(mut self) -> Option<V> {
        loop {
            if let Some(v) = self.rx.borrow_and_update().clone() {
                return Some(v);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Registry = InFlight<(String, String), Arc<String>>;

    fn key() -> (String, String) {
        ("home".to_string(), "en".to_string())
    }

    #[tokio::test]
    async fn follower_receives_leader_result() {
        let registry: Arc<Registry> = Arc::new(InFlight::new());
        let leader = match registry.acquire(key()) {
            Acquired::Leader(l) => l,
            Acquired::Follower(_) => panic!("first caller must lead"),
        };
        let follower = match registry.acquire(key()) {
            Acquired::Follower(f) => f,
            Acquired::Leader(_) => panic!("second caller must follow"),
        };

        let waiter = tokio::spawn(follower.wait());
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.complete(Arc::new("done".to_string()));

        assert_eq!(waiter.await.unwrap().as_deref().map(String::as_str), Some("done"));
        assert!(!registry.is_in_flight(&key()));
    }

    #[tokio::test]
    async fn dropped_leader_releases_slot() {
        let registry: Arc<Registry> = Arc::new(InFlight::new());
        let leader = match registry.acquire(key()) {
            Acquired::Leader(l) => l,
            Acquired::Follower(_) => panic!("first caller must lead"),
        };
        let follower = match registry.acquire(key()) {
            Acquired::Follower(f) => f,
            Acquired::Leader(_) => panic!("second caller must follow"),
        };
        drop(leader);

        assert!(follower.wait().await.is_none());
        assert!(!registry.is_in_flight(&key()));
        assert!(matches!(registry.acquire(key()), Acquired::Leader(_)));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let registry: Arc<Registry> = Arc::new(InFlight::new());
        let _a = registry.acquire(("home".into(), "en".into()));
        assert!(matches!(
            registry.acquire(("home".into(), "ja".into())),
            Acquired::Leader(_)
        ));
        assert!(matches!(
            registry.acquire(("about".into(), "en".into())),
            Acquired::Leader(_)
        ));
    }
}
