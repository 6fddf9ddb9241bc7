//! IP → country lookup over an in-memory range table.
//!
//! The table is a CSV file, one range per line, in either form:
//!
//! ```text
//! 134.35.0.0/16,YE
//! 5.255.0.0,5.255.127.255,YE
//! ```
//!
//! Blank lines and `#` comments are ignored. Ranges must not overlap; a range
//! that overlaps one with a lower start address is dropped at load. IPv4 and IPv6 are stored in one
//! sorted table keyed by the 128-bit (IPv4-mapped) address.

use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::middleware::ip::parse_ip;

/// Country lookup. `None` means the address is not covered.
pub trait CountryResolver: Send + Sync {
    fn country_of(&self, ip: IpAddr) -> Option<String>;

    /// Whether any data is loaded.
    fn is_loaded(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CountryRange {
    start: u128,
    end: u128,
    country: [u8; 2],
}

#[derive(Debug, Default)]
pub struct RangeTableResolver {
    ranges: Vec<CountryRange>,
}

fn to_key(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn country_code(raw: &str) -> Option<[u8; 2]> {
    match raw.trim().to_ascii_uppercase().as_bytes() {
        [a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => Some([*a, *b]),
        _ => None,
    }
}

impl RangeTableResolver {
    /// Resolver with no data; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from `path`, or an empty table when `None`.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` if the file cannot be read.
    pub fn load(path: Option<&str>) -> AppResult<Self> {
        let Some(path) = path else {
            warn!("GEOIP_DATABASE_PATH not set, country lookups will fail open");
            return Ok(Self::empty());
        };

        let raw = std::fs::read_to_string(Path::new(path)).map_err(|e| {
            AppError::ConfigError(format!("Cannot read GeoIP table {path}: {e}"))
        })?;
        let resolver = Self::parse(&raw);
        info!(path, ranges = resolver.len(), "GeoIP range table loaded");
        Ok(resolver)
    }

    /// Parse CSV content, skipping malformed lines.
    pub fn parse(raw: &str) -> Self {
        let mut ranges = Vec::new();
        let mut skipped = 0usize;

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Self::parse_line(line) {
                Some(range) => ranges.push(range),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(skipped, "Ignored malformed GeoIP table lines");
        }

        ranges.sort_by_key(|r| (r.start, r.end));
        let ranges = Self::drop_overlaps(ranges);
        Self { ranges }
    }

    /// Keep the first of any overlapping ranges so lookups stay a single
    /// binary search.
    fn drop_overlaps(sorted: Vec<CountryRange>) -> Vec<CountryRange> {
        let mut kept: Vec<CountryRange> = Vec::with_capacity(sorted.len());
        let mut overlapping = 0usize;
        for range in sorted {
            match kept.last() {
                Some(last) if range.start <= last.end => overlapping += 1,
                _ => kept.push(range),
            }
        }
        if overlapping > 0 {
            warn!(overlapping, "Ignored GeoIP ranges overlapping an earlier range");
        }
        kept
    }

    fn parse_line(line: &str) -> Option<CountryRange> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        match fields.as_slice() {
            [cidr, cc] => {
                let net: IpNet = cidr.parse().ok()?;
                let (start, end) = match net {
                    IpNet::V4(v4) => (
                        to_key(IpAddr::V4(v4.network())),
                        to_key(IpAddr::V4(v4.broadcast())),
                    ),
                    IpNet::V6(v6) => (
                        u128::from(v6.network()),
                        u128::from(v6.broadcast()),
                    ),
                };
                Some(CountryRange {
                    start,
                    end,
                    country: country_code(cc)?,
                })
            }
            [start, end, cc] => {
                let (start, end) = (to_key(parse_ip(start)?), to_key(parse_ip(end)?));
                if start > end {
                    return None;
                }
                Some(CountryRange {
                    start,
                    end,
                    country: country_code(cc)?,
                })
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl CountryResolver for RangeTableResolver {
    fn country_of(&self, ip: IpAddr) -> Option<String> {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
            v4 => v4,
        };
        let key = to_key(ip);

        // Last range starting at or before the address
        let idx = self.ranges.partition_point(|r| r.start <= key);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (key <= range.end).then(|| String::from_utf8_lossy(&range.country).into_owned())
    }

    fn is_loaded(&self) -> bool {
        !self.ranges.is_empty()
    }
}
