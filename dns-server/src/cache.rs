// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded LRU cache of upstream answers
//!
//! Entries are keyed by the question `(name, type, class)`, with the name
//! compared case-insensitively.  Each entry lives for a fixed TTL from the
//! moment it was inserted; an expired entry is never returned and is dropped
//! when it is next looked up.  When the cache is full, inserting evicts the
//! least recently used entry.

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{DNSClass, RecordType};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Key {
    name: String,
    qtype: RecordType,
    qclass: DNSClass,
}

impl From<&Query> for Key {
    fn from(query: &Query) -> Self {
        Key {
            name: query.name().to_string().to_ascii_lowercase(),
            qtype: query.query_type(),
            qclass: query.query_class(),
        }
    }
}

struct Entry {
    msg: Message,
    inserted: Instant,
    /// Position in `Inner::recency`
    used: u64,
}

struct Inner {
    entries: IndexMap<Key, Entry>,
    /// Keys by last use, least recent first
    recency: BTreeMap<u64, Key>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &Key) -> Option<Entry> {
        let entry = self.entries.swap_remove(key)?;
        self.recency.remove(&entry.used);
        Some(entry)
    }
}

pub struct Cache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl Cache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Cache {
            capacity,
            ttl,
            inner: Mutex::new(Inner {
                entries: IndexMap::with_capacity(capacity),
                recency: BTreeMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Caches `msg` under its first question.  Messages without a question
    /// are ignored.
    pub fn add(&self, msg: &Message) {
        let Some(query) = msg.queries().first() else {
            return;
        };
        if self.capacity == 0 {
            return;
        }
        let key = Key::from(query);

        let mut inner = self.inner.lock().unwrap();
        inner.remove(&key);
        while inner.entries.len() >= self.capacity {
            let Some((_, oldest)) = inner.recency.pop_first() else {
                break;
            };
            inner.entries.swap_remove(&oldest);
        }
        let used = inner.next_tick();
        inner.recency.insert(used, key.clone());
        inner.entries.insert(
            key,
            Entry { msg: msg.clone(), inserted: Instant::now(), used },
        );
    }

    /// Returns the cached answer to `query`, if one exists and has not
    /// outlived the TTL.
    pub fn get(&self, query: &Query) -> Option<Message> {
        let key = Key::from(query);
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get(&key) else {
            inner.misses += 1;
            return None;
        };
        if entry.inserted.elapsed() > self.ttl {
            inner.remove(&key);
            inner.misses += 1;
            return None;
        }
        let previous = entry.used;
        let msg = entry.msg.clone();

        let used = inner.next_tick();
        inner.recency.remove(&previous);
        inner.recency.insert(used, key.clone());
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.used = used;
        }
        inner.hits += 1;
        Some(msg)
    }

    pub fn remove(&self, query: &Query) {
        let key = Key::from(query);
        self.inner.lock().unwrap().remove(&key);
    }

    /// Drops every entry and zeroes the counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.recency.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.inner.lock().unwrap().hits
    }

    pub fn misses(&self) -> u64 {
        self.inner.lock().unwrap().misses
    }
}
