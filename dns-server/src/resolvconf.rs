// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading upstream nameservers from `resolv.conf`

use camino::Utf8Path;
use std::net::IpAddr;

/// The standard resolver limit
pub const MAX_NAMESERVERS: usize = 3;

/// Returns the IP-literal `nameserver` entries of a `resolv.conf`, at most
/// [`MAX_NAMESERVERS`] of them.
pub fn parse(contents: &str) -> Vec<IpAddr> {
    contents
        .lines()
        .filter(|line| !line.starts_with(';') && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse().ok(),
                _ => None,
            }
        })
        .take(MAX_NAMESERVERS)
        .collect()
}

/// As [`parse`], on the file at `path`.  An unreadable file yields no
/// nameservers.
pub fn from_file(path: &Utf8Path) -> Vec<IpAddr> {
    std::fs::read_to_string(path).map(|c| parse(&c)).unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_ip_literals_are_kept() {
        let servers = parse(
            "# generated by dhcp\n\
             ; old style comment\n\
             search eng.vmware.com\n\
             nameserver 10.118.81.1\n\
             nameserver dns.example.com\n\
             nameserver fd00::53\n\
             #nameserver 8.8.8.8\n",
        );
        assert_eq!(
            servers,
            vec![
                "10.118.81.1".parse::<IpAddr>().unwrap(),
                "fd00::53".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn at_most_three() {
        let contents: String = (1..=5)
            .map(|i| format!("nameserver 10.0.0.{}\n", i))
            .collect();
        assert_eq!(parse(&contents).len(), MAX_NAMESERVERS);
    }

    #[test]
    fn reads_file() {
        let dir = vch_test_utils::dev::scratch_dir_with_files(&[(
            "resolv.conf",
            b"nameserver 192.168.1.1\n".as_slice(),
        )]);
        assert_eq!(
            from_file(&dir.path().join("resolv.conf")),
            vec!["192.168.1.1".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn missing_file_yields_nothing() {
        let path = Utf8Path::new("/nonexistent/resolv.conf");
        assert!(from_file(path).is_empty());
    }
}
