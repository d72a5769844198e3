//! Typed data sets backing each [`crate::acl::term::AclKind`].
//!
//! Squid's source keeps these in splay trees for amortized O(log n) match
//! and dump (spec.md §GLOSSARY: "Any balanced ordered map is an acceptable
//! substitute"). These sets favor a plain `Vec`/`String` representation —
//! ACL lists in practice hold tens to low hundreds of entries, and a linear
//! scan over a contiguous slice beats tree traversal at that size. Regexes
//! keep their move-to-front self-promotion, since that's a real optimization
//! independent of the underlying container.

use regex::Regex;
use std::net::IpAddr;

/// A single CIDR-style address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    pub network: IpAddr,
    pub prefix_len: u8,
}

impl CidrRange {
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            network: addr,
            prefix_len,
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(host)) => {
                let mask = mask32(self.prefix_len);
                u32::from(net) & mask == u32::from(*host) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(host)) => {
                let mask = mask128(self.prefix_len);
                u128::from(net) & mask == u128::from(*host) & mask
            }
            _ => false,
        }
    }

    pub fn dump(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }
}

fn mask32(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len.min(32))
    }
}

fn mask128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len.min(128))
    }
}

/// IPv4/IPv6 address set used by the `source-ip`/`destination-ip` term kinds.
#[derive(Debug, Clone, Default)]
pub struct IpSet(pub Vec<CidrRange>);

impl IpSet {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.0.iter().any(|range| range.contains(addr))
    }

    pub fn dump(&self) -> Vec<String> {
        self.0.iter().map(CidrRange::dump).collect()
    }
}

/// Domain suffix set used by `source-domain`/`destination-domain`.
///
/// Entries are stored lowercased with a leading `.`; a bare domain without
/// a leading dot matches only the exact name, mirroring Squid's `dstdomain`
/// convention where `.example.org` also matches `example.org` itself.
#[derive(Debug, Clone, Default)]
pub struct DomainSet(pub Vec<String>);

impl DomainSet {
    pub fn insert(&mut self, pattern: &str) {
        self.0.push(pattern.to_ascii_lowercase());
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.0.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('.') {
                host == suffix || host.ends_with(pattern.as_str())
            } else {
                host == *pattern
            }
        })
    }

    pub fn dump(&self) -> &[String] {
        &self.0
    }
}

/// Compiled regex list with move-to-front self-promotion (spec.md §3: "on-match
/// self-promotes toward head as a move-to-front cache").
#[derive(Debug, Clone, Default)]
pub struct RegexList(pub Vec<Regex>);

impl RegexList {
    pub fn matches(&mut self, haystack: &str) -> bool {
        if let Some(pos) = self.0.iter().position(|re| re.is_match(haystack)) {
            if pos != 0 {
                let hit = self.0.remove(pos);
                self.0.insert(0, hit);
            }
            true
        } else {
            false
        }
    }

    pub fn dump(&self) -> Vec<String> {
        self.0.iter().map(|re| re.as_str().to_owned()).collect()
    }
}

/// Integer interval set used by `http-status` (ordered tree of intervals in
/// the source; a sorted `Vec` of inclusive ranges suffices here).
#[derive(Debug, Clone, Default)]
pub struct IntervalSet(pub Vec<(u16, u16)>);

impl IntervalSet {
    pub fn contains(&self, value: u16) -> bool {
        self.0.iter().any(|(lo, hi)| (*lo..=*hi).contains(&value))
    }
}

/// Day-of-week mask plus a [start, stop) minute-of-day range, used by
/// `time-of-day` (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct TimeOfDay {
    /// Bit 0 = Sunday .. bit 6 = Saturday.
    pub day_mask: u8,
    pub start_minute: u16,
    pub stop_minute: u16,
}

impl TimeOfDay {
    pub fn matches(&self, weekday_from_sunday: u8, minute_of_day: u16) -> bool {
        let day_bit = 1u8 << (weekday_from_sunday % 7);
        if self.day_mask & day_bit == 0 {
            return false;
        }
        if self.start_minute <= self.stop_minute {
            (self.start_minute..self.stop_minute).contains(&minute_of_day)
        } else {
            // Wraps past midnight.
            minute_of_day >= self.start_minute || minute_of_day < self.stop_minute
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_v4_contains() {
        let range = CidrRange {
            network: "10.0.0.0".parse().unwrap(),
            prefix_len: 8,
        };
        assert!(range.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!range.contains(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn domain_suffix_match() {
        let mut set = DomainSet::default();
        set.insert(".example.org");

        assert!(set.matches("example.org"));
        assert!(set.matches("host.example.org"));
        assert!(!set.matches("notexample.org"));
    }

    #[test]
    fn regex_move_to_front() {
        let mut list = RegexList(vec![
            Regex::new("^a$").unwrap(),
            Regex::new("^b$").unwrap(),
            Regex::new("^c$").unwrap(),
        ]);

        assert!(list.matches("c"));
        assert_eq!(list.0[0].as_str(), "^c$");
    }

    #[test]
    fn time_of_day_wraps_midnight() {
        let window = TimeOfDay {
            day_mask: 0b0000001, // Sunday
            start_minute: 23 * 60,
            stop_minute: 2 * 60,
        };
        assert!(window.matches(0, 23 * 60 + 30));
        assert!(window.matches(0, 60));
        assert!(!window.matches(0, 12 * 60));
        assert!(!window.matches(1, 23 * 60 + 30));
    }
}
