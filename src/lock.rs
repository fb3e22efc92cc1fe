// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Striped per-key asynchronous locks.
//!
//! Twin and reported-queue mutations for the same client id must be
//! totally ordered; operations on different ids should proceed in
//! parallel. A fixed stripe of mutexes keeps memory bounded regardless
//! of how many ids pass through the gateway: collisions between ids
//! only serialize, they never deadlock, because an operation holds at
//! most one stripe at a time.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Fixed-width table of striped async mutexes indexed by key hash.
pub struct KeyedLocks {
    stripes: Vec<Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Create a table with `stripes` mutexes (at least one).
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1);
        Self {
            stripes: (0..count).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    /// Number of stripes in the table.
    #[must_use]
    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }

    /// Acquire exclusive access for `key`. The guard releases on drop,
    /// on every termination path.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let index = (fnv1a(key) % self.stripes.len() as u64) as usize;
        Arc::clone(&self.stripes[index]).lock_owned().await
    }
}

/// FNV-1a: stable across processes, unlike `DefaultHasher`.
fn fnv1a(key: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_stripe_count_is_at_least_one() {
        assert_eq!(KeyedLocks::new(0).stripes(), 1);
        assert_eq!(KeyedLocks::new(10).stripes(), 10);
    }

    #[test]
    fn test_fnv1a_is_stable() {
        // Reference values for the 64-bit FNV-1a parameters.
        assert_eq!(fnv1a(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a("a"), fnv1a("a"));
        assert_ne!(fnv1a("device-1"), fnv1a("device-2"));
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new(4));
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let locks = locks.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("same-key").await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_stripes_run_in_parallel() {
        let locks = KeyedLocks::new(64);

        // find two keys landing on different stripes
        let key_a = "a".to_string();
        let mut key_b = String::new();
        for i in 0..1000 {
            let candidate = format!("b{}", i);
            if fnv1a(&candidate) % 64 != fnv1a(&key_a) % 64 {
                key_b = candidate;
                break;
            }
        }
        assert!(!key_b.is_empty());

        let _guard_a = locks.acquire(&key_a).await;
        // must not block behind guard_a
        let guard_b = tokio::time::timeout(Duration::from_secs(1), locks.acquire(&key_b))
            .await
            .expect("different stripe should not contend");
        drop(guard_b);
    }

    #[tokio::test]
    async fn test_guard_released_on_drop() {
        let locks = KeyedLocks::new(1);

        {
            let _guard = locks.acquire("k").await;
        }
        // reacquire immediately; hangs if the drop leaked the permit
        let _guard = tokio::time::timeout(Duration::from_secs(1), locks.acquire("k"))
            .await
            .expect("guard should have been released");
    }
}
