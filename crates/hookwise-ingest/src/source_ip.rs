//! Allowlist of source address ranges.
//!
//! When configured, only requests from the listed CIDR ranges are accepted.
//! Ranges are supplied by configuration (for example the `hooks` entries of
//! GitHub's published meta information); the pipeline does not fetch them.

use std::{fmt, net::IpAddr, str::FromStr};

use thiserror::Error;

/// Range parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid CIDR range '{input}': {reason}")]
pub struct RangeParseError {
    input: String,
    reason: &'static str,
}

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    network: IpAddr,
    prefix: u8,
}

impl IpRange {
    /// Returns true if `addr` lies inside the range.
    ///
    /// IPv4-mapped IPv6 addresses are compared as IPv4.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            },
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            },
            _ => false,
        }
    }
}

impl FromStr for IpRange {
    type Err = RangeParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = |reason| RangeParseError { input: input.to_string(), reason };
        let trimmed = input.trim();

        let (address, prefix) = match trimmed.split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (trimmed, None),
        };

        let network: IpAddr = address.parse().map_err(|_| err("not an IP address"))?;
        let max_prefix = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| err("prefix is not a number"))?,
            None => max_prefix,
        };
        if prefix > max_prefix {
            return Err(err("prefix exceeds address width"));
        }

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Set of accepted source ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceAllowlist {
    ranges: Vec<IpRange>,
}

impl SourceAllowlist {
    /// Parses each entry as a CIDR range or single address.
    ///
    /// # Errors
    ///
    /// Returns the first entry that fails to parse.
    pub fn parse<I, S>(entries: I) -> Result<Self, RangeParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ranges =
            entries.into_iter().map(|e| e.as_ref().parse()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ranges })
    }

    /// Returns true if any range contains `addr`.
    pub fn permits(&self, addr: IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(addr))
    }

    /// Returns true if no ranges are configured.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the configured ranges.
    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ipv4_ranges_match_by_prefix() {
        let range: IpRange = "192.30.252.0/22".parse().unwrap();
        assert!(range.contains(ip("192.30.252.1")));
        assert!(range.contains(ip("192.30.255.254")));
        assert!(!range.contains(ip("192.30.248.1")));
        assert!(!range.contains(ip("10.0.0.1")));
    }

    #[test]
    fn ipv6_and_mapped_addresses() {
        let v6: IpRange = "2a0a:a440::/29".parse().unwrap();
        assert!(v6.contains(ip("2a0a:a440::1")));
        assert!(!v6.contains(ip("2001:db8::1")));
        assert!(!v6.contains(ip("140.82.112.1")));

        let v4: IpRange = "140.82.112.0/20".parse().unwrap();
        assert!(v4.contains(ip("::ffff:140.82.112.9")));
    }

    #[test]
    fn single_addresses_and_zero_prefix() {
        let single: IpRange = "127.0.0.1".parse().unwrap();
        assert_eq!(single.to_string(), "127.0.0.1/32");
        assert!(single.contains(ip("127.0.0.1")));
        assert!(!single.contains(ip("127.0.0.2")));

        let everything: IpRange = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(ip("8.8.8.8")));
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!("10.0.0.0/33".parse::<IpRange>().is_err());
        assert!("10.0.0/8".parse::<IpRange>().is_err());
        assert!("10.0.0.0/x".parse::<IpRange>().is_err());
        assert!(SourceAllowlist::parse(["10.0.0.0/8", "bogus"]).is_err());
    }

    #[test]
    fn allowlist_permits_any_matching_range() {
        let allowlist = SourceAllowlist::parse(["10.0.0.0/8", "192.168.1.0/24"]).unwrap();
        assert!(allowlist.permits(ip("10.1.2.3")));
        assert!(allowlist.permits(ip("192.168.1.77")));
        assert!(!allowlist.permits(ip("192.168.2.1")));
        assert_eq!(allowlist.ranges().len(), 2);
    }
}
