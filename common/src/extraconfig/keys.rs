// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key paths and their rendering into guest-info keys

use std::collections::BTreeMap;
use std::ops::Bound;

/// Leading portion of every key visible to the guest
pub const GUESTINFO_PREFIX: &str = "guestinfo.vice.";

/// Suffix marking a key whose value is sealed with the per-VCH secret
pub const SECRET_SUFFIX: &str = "@secret";

/// Separator between a collection field and one of its entries
pub(crate) const ENTRY_SEPARATOR: char = '|';

const READ_ONLY_SEPARATOR: char = '/';
const READ_WRITE_SEPARATOR: char = '.';

/// Location of a value within an encoded tree
///
/// Keys the guest may only read are rendered as
/// `guestinfo.vice./a/b/c`.  Keys the guest may also write are rendered with
/// `.` separators (`guestinfo.vice..a.b.c`), which is what the hypervisor
/// uses to decide writability.  Either kind may be sealed, which appends
/// `@secret`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct KeyPath {
    segments: Vec<String>,
    published: bool,
    secret: bool,
}

impl KeyPath {
    /// Parses a prefix such as `executor/sessions|abc` into a path.
    pub(crate) fn from_prefix(prefix: &str) -> Self {
        let segments = prefix
            .split(READ_ONLY_SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        KeyPath { segments, published: false, secret: false }
    }

    pub(crate) fn child(&self, name: &str) -> Self {
        let mut path = self.clone();
        path.segments.push(name.to_string());
        path
    }

    /// Path of entry `key` of the collection at this path.
    pub(crate) fn entry(&self, key: &str) -> Self {
        let mut path = self.clone();
        match path.segments.last_mut() {
            Some(last) => {
                last.push(ENTRY_SEPARATOR);
                last.push_str(key);
            }
            None => path.segments.push(key.to_string()),
        }
        path
    }

    pub(crate) fn published(&self) -> Self {
        KeyPath { published: true, ..self.clone() }
    }

    pub(crate) fn sealed(&self) -> Self {
        KeyPath { secret: true, ..self.clone() }
    }

    pub(crate) fn is_secret(&self) -> bool {
        self.secret
    }

    fn base(&self, separator: char) -> String {
        let sep = separator.to_string();
        format!("{GUESTINFO_PREFIX}{sep}{}", self.segments.join(&sep))
    }

    pub(crate) fn render(&self) -> String {
        let separator = if self.published {
            READ_WRITE_SEPARATOR
        } else {
            READ_ONLY_SEPARATOR
        };
        let mut key = self.base(separator);
        if self.secret {
            key.push_str(SECRET_SUFFIX);
        }
        key
    }

    /// Every key a value at exactly this path may be stored under.
    pub(crate) fn probe_keys(&self) -> [String; 4] {
        let plain = KeyPath { published: false, secret: false, ..self.clone() };
        [
            plain.render(),
            plain.sealed().render(),
            plain.published().render(),
            plain.published().sealed().render(),
        ]
    }

    /// Returns true if `map` holds a value at this path or anywhere beneath
    /// it, in either scope.
    pub(crate) fn has_data(&self, map: &BTreeMap<String, String>) -> bool {
        [READ_ONLY_SEPARATOR, READ_WRITE_SEPARATOR].into_iter().any(|sep| {
            let base = self.base(sep);
            let start = Bound::Included(base.as_str());
            map.range::<str, _>((start, Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(&base))
                .any(|(k, _)| {
                    let rest = &k[base.len()..];
                    rest.is_empty()
                        || rest == SECRET_SUFFIX
                        || rest.starts_with(sep)
                        || rest.starts_with(ENTRY_SEPARATOR)
                })
        })
    }
}

/// Returns true if `key` is one the guest is allowed to write.
pub fn is_published(key: &str) -> bool {
    key.strip_prefix(GUESTINFO_PREFIX)
        .map(|rest| rest.starts_with(READ_WRITE_SEPARATOR))
        .unwrap_or(false)
}

/// Renders the read-only key for a `/`-separated path.
pub fn read_only_key(path: &str) -> String {
    KeyPath::from_prefix(path).render()
}

/// Renders the guest-writable key for a `/`-separated path.
pub fn published_key(path: &str) -> String {
    KeyPath::from_prefix(path).published().render()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_scopes() {
        let p = KeyPath::from_prefix("executor").child("sessions").entry("abc");
        assert_eq!(p.render(), "guestinfo.vice./executor/sessions|abc");
        let started = p.child("started").published();
        assert_eq!(
            started.render(),
            "guestinfo.vice..executor.sessions|abc.started"
        );
        assert!(is_published(&started.render()));
        let key = p.child("key").sealed();
        assert_eq!(
            key.render(),
            "guestinfo.vice./executor/sessions|abc/key@secret"
        );
        assert!(!is_published(&key.render()));
    }

    #[test]
    fn has_data_ignores_siblings_with_common_prefix() {
        let mut map = BTreeMap::new();
        map.insert("guestinfo.vice./name2".to_string(), "x".to_string());
        let name = KeyPath::default().child("name");
        assert!(!name.has_data(&map));
        map.insert(
            "guestinfo.vice..name.started".to_string(),
            "true".to_string(),
        );
        assert!(name.has_data(&map));
    }
}
