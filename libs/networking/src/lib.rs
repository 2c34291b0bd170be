//! Networking utilities for the VIP controller.
//!
//! This library provides helpers for:
//! - Parsing the VIP pool specification into an ordered candidate list
//! - IPv4 integer conversions used by range expansion
//! - Splitting the allocated VIP fleet into the two redundancy groups

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool specification could not be parsed.
    #[error("invalid pool spec at line {line}: {reason}")]
    InvalidPoolSpec { line: usize, reason: String },
}

impl PoolError {
    fn at(line: usize, reason: impl Into<String>) -> Self {
        PoolError::InvalidPoolSpec {
            line,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// IPv4 helpers
// ============================================================================

/// Interpret an address as a 32-bit big-endian integer.
pub fn ipv4_to_u32(addr: Ipv4Addr) -> u32 {
    u32::from_be_bytes(addr.octets())
}

/// Inverse of [`ipv4_to_u32`].
pub fn u32_to_ipv4(bits: u32) -> Ipv4Addr {
    Ipv4Addr::from(bits.to_be_bytes())
}

// ============================================================================
// Pool Loader
// ============================================================================

/// Upper bound on the number of addresses a single range line may expand to.
pub const MAX_RANGE_LEN: u64 = 65_536;

/// Parse a textual pool specification.
///
/// Each non-blank line that does not start with `#` is either a single
/// dotted-quad address or an inclusive range `start - end`. Ranges expand in
/// numeric order. An address seen on an earlier line is not repeated, so the
/// result keeps first-seen order.
pub fn parse_pool(spec: &str) -> Result<Vec<Ipv4Addr>, PoolError> {
    let mut pool = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw) in spec.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let addrs = match line.split_once('-') {
            Some((start, end)) => expand_range(line_no, start, end)?,
            None => vec![parse_addr(line_no, line)?],
        };

        for addr in addrs {
            if seen.insert(addr) {
                pool.push(addr);
            }
        }
    }

    Ok(pool)
}

fn parse_addr(line: usize, s: &str) -> Result<Ipv4Addr, PoolError> {
    let s = s.trim();
    Ipv4Addr::from_str(s).map_err(|_| PoolError::at(line, format!("invalid IPv4 address '{s}'")))
}

fn expand_range(line: usize, start: &str, end: &str) -> Result<Vec<Ipv4Addr>, PoolError> {
    if end.contains('-') {
        return Err(PoolError::at(line, "range must have exactly one '-'"));
    }

    let start = ipv4_to_u32(parse_addr(line, start)?);
    let end = ipv4_to_u32(parse_addr(line, end)?);

    if end < start {
        return Err(PoolError::at(
            line,
            format!(
                "range end {} is below start {}",
                u32_to_ipv4(end),
                u32_to_ipv4(start)
            ),
        ));
    }

    let len = u64::from(end - start) + 1;
    if len > MAX_RANGE_LEN {
        return Err(PoolError::at(
            line,
            format!("range spans {len} addresses (limit {MAX_RANGE_LEN})"),
        ));
    }

    // Inclusive u32 ranges stop at u32::MAX without wrapping.
    Ok((start..=end).map(u32_to_ipv4).collect())
}

// ============================================================================
// Redundancy groups
// ============================================================================

/// Split the allocated VIP fleet into two redundancy groups.
///
/// Addresses are sorted numerically and deduplicated; the first group takes
/// the larger half when the count is odd. The split is a pure function of
/// the address set, so republishing the same fleet yields the same groups.
pub fn split_vip_groups<I>(addrs: I) -> (Vec<Ipv4Addr>, Vec<Ipv4Addr>)
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    let mut sorted: Vec<Ipv4Addr> = addrs.into_iter().collect();
    sorted.sort_by_key(|a| ipv4_to_u32(*a));
    sorted.dedup();

    let half = sorted.len().div_ceil(2);
    let second = sorted.split_off(half);
    (sorted, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_singles_and_ranges() {
        let spec = "\
# primary range
10.1.1.55
10.1.1.56

10.1.1.60 - 10.1.1.65
";
        let pool = parse_pool(spec).unwrap();
        assert_eq!(pool.len(), 8);
        assert_eq!(pool[0], ip("10.1.1.55"));
        assert_eq!(pool[2], ip("10.1.1.60"));
        assert_eq!(pool[7], ip("10.1.1.65"));
    }

    #[test]
    fn test_range_crosses_octet_boundary() {
        let pool = parse_pool("10.0.0.254-10.0.1.1").unwrap();
        assert_eq!(
            pool,
            vec![
                ip("10.0.0.254"),
                ip("10.0.0.255"),
                ip("10.0.1.0"),
                ip("10.0.1.1")
            ]
        );
    }

    #[test]
    fn test_range_at_top_of_address_space_terminates() {
        let pool = parse_pool("255.255.255.253-255.255.255.255").unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(*pool.last().unwrap(), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_duplicates_keep_first_position() {
        let pool = parse_pool("10.0.0.2\n10.0.0.1-10.0.0.3\n10.0.0.2").unwrap();
        assert_eq!(pool, vec![ip("10.0.0.2"), ip("10.0.0.1"), ip("10.0.0.3")]);
    }

    #[rstest]
    #[case::bad_octet("10.0.0.256", 1)]
    #[case::ipv6("fd00::1", 1)]
    #[case::garbage("not-an-ip", 1)]
    #[case::reversed("# c\n10.0.0.9 - 10.0.0.1", 2)]
    #[case::double_dash("10.0.0.1-10.0.0.2-10.0.0.3", 1)]
    #[case::empty_side("10.0.0.1-", 1)]
    #[case::too_large("10.0.0.0-10.2.0.0", 1)]
    fn test_invalid_specs(#[case] spec: &str, #[case] expected_line: usize) {
        match parse_pool(spec) {
            Err(PoolError::InvalidPoolSpec { line, .. }) => assert_eq!(line, expected_line),
            other => panic!("expected InvalidPoolSpec, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_spec_is_empty_pool() {
        assert!(parse_pool("\n# nothing here\n   \n").unwrap().is_empty());
    }

    #[rstest]
    #[case(0, 0, 0)]
    #[case(1, 1, 0)]
    #[case(2, 1, 1)]
    #[case(5, 3, 2)]
    #[case(6, 3, 3)]
    fn test_split_sizes(#[case] n: u32, #[case] first: usize, #[case] second: usize) {
        let addrs = (0..n).map(|i| u32_to_ipv4(0x0a00_0000 + i));
        let (g1, g2) = split_vip_groups(addrs);
        assert_eq!(g1.len(), first);
        assert_eq!(g2.len(), second);
    }

    #[test]
    fn test_split_is_order_independent() {
        let a = vec![ip("10.0.0.10"), ip("10.0.0.2"), ip("10.0.0.3")];
        let b = vec![ip("10.0.0.3"), ip("10.0.0.10"), ip("10.0.0.2"), ip("10.0.0.2")];

        let (g1, g2) = split_vip_groups(a);
        assert_eq!(g1, vec![ip("10.0.0.2"), ip("10.0.0.3")]);
        assert_eq!(g2, vec![ip("10.0.0.10")]);
        assert_eq!(split_vip_groups(b), (g1, g2));
    }

    proptest! {
        #[test]
        fn prop_range_expansion_is_exact(start in any::<u32>(), span in 0u32..512) {
            let end = start.saturating_add(span);
            let spec = format!("{} - {}", u32_to_ipv4(start), u32_to_ipv4(end));
            let pool = parse_pool(&spec).unwrap();

            prop_assert_eq!(pool.len() as u64, u64::from(end - start) + 1);
            prop_assert_eq!(pool[0], u32_to_ipv4(start));
            prop_assert_eq!(*pool.last().unwrap(), u32_to_ipv4(end));
            prop_assert!(pool.windows(2).all(|w| ipv4_to_u32(w[0]) + 1 == ipv4_to_u32(w[1])));
        }
    }
}
