// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal names accepted over the back-channel

use std::str::FromStr;

/// Signals a client may deliver to a session, by their SSH names
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Signal {
    Abrt,
    Alrm,
    Fpe,
    Hup,
    Ill,
    Int,
    Kill,
    Pipe,
    Quit,
    Segv,
    Term,
    Usr1,
    Usr2,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unsupported signal {0:?}")]
pub struct UnknownSignal(pub String);

impl Signal {
    /// Linux signal number
    pub fn number(self) -> i32 {
        match self {
            Signal::Abrt => 6,
            Signal::Alrm => 14,
            Signal::Fpe => 8,
            Signal::Hup => 1,
            Signal::Ill => 4,
            Signal::Int => 2,
            Signal::Kill => 9,
            Signal::Pipe => 13,
            Signal::Quit => 3,
            Signal::Segv => 11,
            Signal::Term => 15,
            Signal::Usr1 => 10,
            Signal::Usr2 => 12,
        }
    }

    /// Parses `TERM` or `SIGTERM`.
    pub fn parse(name: &str) -> Result<Signal, UnknownSignal> {
        let bare = name.strip_prefix("SIG").unwrap_or(name);
        Signal::from_str(bare).map_err(|_| UnknownSignal(name.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    #[test]
    fn table() {
        let table: Vec<(String, i32)> =
            Signal::iter().map(|s| (s.to_string(), s.number())).collect();
        let expected = [
            ("ABRT", 6),
            ("ALRM", 14),
            ("FPE", 8),
            ("HUP", 1),
            ("ILL", 4),
            ("INT", 2),
            ("KILL", 9),
            ("PIPE", 13),
            ("QUIT", 3),
            ("SEGV", 11),
            ("TERM", 15),
            ("USR1", 10),
            ("USR2", 12),
        ];
        let expected: Vec<_> =
            expected.iter().map(|(n, v)| (n.to_string(), *v)).collect();
        assert_eq!(table, expected);
        assert_eq!(Signal::number(Signal::Term), libc::SIGTERM);
        assert_eq!(Signal::number(Signal::Usr2), libc::SIGUSR2);
    }

    #[test]
    fn sig_prefix() {
        assert_eq!(Signal::parse("SIGKILL"), Ok(Signal::Kill));
        assert_eq!(Signal::parse("KILL"), Ok(Signal::Kill));
        assert!(Signal::parse("SIGSTOP").is_err());
        assert!(Signal::parse("").is_err());
    }

    proptest! {
        #[test]
        fn parse_is_total(name in "\\PC{0,12}") {
            match Signal::parse(&name) {
                Ok(signal) => {
                    let bare = name.strip_prefix("SIG").unwrap_or(&name);
                    prop_assert_eq!(signal.to_string(), bare);
                }
                Err(UnknownSignal(echo)) => prop_assert_eq!(echo, name),
            }
        }
    }
}
