// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coalescing of identical in-flight work
//!
//! The first caller for a key starts the work; callers that arrive while it
//! is still running wait on the same future and receive a clone of its
//! output.  Once the work completes the key is forgotten, so the next caller
//! starts fresh.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

pub struct Group<K, V> {
    calls: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Group { calls: Mutex::new(HashMap::new()) }
    }
}

impl<K, V> Group<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` for `key` unless a run for the same key is already in
    /// flight, in which case its result is shared.
    pub async fn run<F>(&self, key: K, work: F) -> V
    where
        F: Future<Output = V> + Send + 'static,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get(&key) {
                Some(call) => (call.clone(), false),
                None => {
                    let call = work.boxed().shared();
                    calls.insert(key.clone(), call.clone());
                    (call, true)
                }
            }
        };

        if !leader {
            return call.await;
        }
        let _forget = Forget { group: self, key };
        call.await
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

struct Forget<'a, K: Eq + Hash, V> {
    group: &'a Group<K, V>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for Forget<'_, K, V> {
    fn drop(&mut self) {
        self.group.calls.lock().unwrap().remove(&self.key);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_run() {
        let group = Arc::new(Group::<&'static str, usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let callers: Vec<_> = (0..10)
            .map(|_| {
                let group = Arc::clone(&group);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    group
                        .run("vmware.com.", async move {
                            tokio::time::sleep(Duration::from_millis(100))
                                .await;
                            runs.fetch_add(1, Ordering::SeqCst) + 42
                        })
                        .await
                })
            })
            .collect();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_callers_run_again() {
        let group = Group::<u16, u16>::new();
        assert_eq!(group.run(1, async { 7 }).await, 7);
        assert_eq!(group.run(1, async { 8 }).await, 8);
        assert_eq!(group.in_flight(), 0);
    }
}
