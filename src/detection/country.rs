use crate::config::{ConfigError, CountryRangeConfig};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("country lookup unavailable: {0}")]
    Unavailable(String),
    #[error("country lookup failed: {0}")]
    Lookup(String),
}

/// Maps a client IP to an ISO 3166-1 alpha-2 country code.
///
/// `Ok(None)` means the country is unknown. Callers treat errors exactly like
/// unknown: a lookup problem must never block a request.
pub trait CountryResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> Result<Option<String>, ResolveError>;
}

/// Resolver that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

impl CountryResolver for NoopResolver {
    fn resolve(&self, _ip: &str) -> Result<Option<String>, ResolveError> {
        Ok(None)
    }
}

/// Static range table resolver.
///
/// Supports both individual IPs and CIDR ranges:
/// - Individual IP: "192.168.1.1" (treated as /32 for IPv4, /128 for IPv6)
/// - CIDR range: "1.12.0.0/14", "2001:db8::/32"
///
/// When ranges overlap, the most specific prefix wins.
#[derive(Debug, Default, Clone)]
pub struct CidrCountryResolver {
    ranges: Vec<(IpNetwork, String)>,
}

impl CidrCountryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(ranges: &[CountryRangeConfig]) -> Result<Self, ConfigError> {
        let mut resolver = Self::new();
        for range in ranges {
            resolver
                .add_range(&range.cidr, &range.country)
                .map_err(|reason| ConfigError::CountryRange {
                    cidr: range.cidr.clone(),
                    reason,
                })?;
        }
        Ok(resolver)
    }

    pub fn add_range(&mut self, ip_or_cidr: &str, country: &str) -> Result<(), String> {
        let country = country.trim().to_ascii_uppercase();
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("Invalid country code: {}", country));
        }
        let network = parse_ip_or_cidr(ip_or_cidr)?;
        self.ranges.push((network, country));
        // Most specific prefix first so the first hit wins
        self.ranges.sort_by(|a, b| b.0.prefix().cmp(&a.0.prefix()));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl CountryResolver for CidrCountryResolver {
    fn resolve(&self, ip: &str) -> Result<Option<String>, ResolveError> {
        let addr = match IpAddr::from_str(ip.trim()) {
            Ok(addr) => addr,
            Err(_) => return Ok(None), // Invalid IP format, unknown country
        };

        Ok(self
            .ranges
            .iter()
            .find(|(network, _)| network.contains(addr))
            .map(|(_, country)| country.clone()))
    }
}

/// Parse an IP address or CIDR notation string into an IpNetwork
fn parse_ip_or_cidr(input: &str) -> Result<IpNetwork, String> {
    let input = input.trim();
    if let Ok(network) = IpNetwork::from_str(input) {
        return Ok(network);
    }

    match IpAddr::from_str(input) {
        Ok(ip @ IpAddr::V4(_)) => IpNetwork::new(ip, 32).map_err(|e| e.to_string()),
        Ok(ip @ IpAddr::V6(_)) => IpNetwork::new(ip, 128).map_err(|e| e.to_string()),
        Err(_) => Err(format!("Invalid IP address or CIDR notation: {}", input)),
    }
}
