use crate::detection::{CidrCountryResolver, SchemaTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid schema pattern {pattern:?}: {source}")]
    SchemaPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid country range {cidr:?}: {reason}")]
    CountryRange { cidr: String, reason: String },
}

/// Static configuration of a decision engine. Every tuning constant the
/// pipeline uses lives here.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub graphql: GraphqlConfig,
    #[serde(default)]
    pub heuristics: HeuristicsConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Path/method whitelist. Empty disables the schema check.
    #[serde(default)]
    pub schema: Vec<SchemaRuleConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LimitsConfig {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
    #[serde(default = "default_suspicious_paths")]
    pub suspicious_paths: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserAgentConfig {
    #[serde(default = "default_ua_blacklist")]
    pub blacklist: Vec<String>,
    #[serde(default = "default_missing_ua_penalty")]
    pub missing_penalty: i32,
    #[serde(default = "default_incomplete_profile_penalty")]
    pub incomplete_profile_penalty: i32,
    #[serde(default = "default_small_bonus")]
    pub complete_profile_bonus: i32,
    #[serde(default = "default_client_hints_penalty")]
    pub client_hints_penalty: i32,
    #[serde(default = "default_small_bonus")]
    pub client_hints_bonus: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,
    #[serde(default = "default_ip_threshold")]
    pub ip_threshold: u32,
    #[serde(default = "default_max_ip_track")]
    pub max_ip_track: usize,
    /// Recent request paths kept per IP for the classifier. Zero keeps none.
    #[serde(default = "default_path_history")]
    pub path_history: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GeoConfig {
    /// ISO 3166-1 alpha-2 codes that are blocked outright.
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    /// Country code -> language tag expected in Accept-Language.
    #[serde(default = "default_language_expectations")]
    pub language_expectations: BTreeMap<String, String>,
    /// Static ranges used by the built-in resolver.
    #[serde(default)]
    pub ranges: Vec<CountryRangeConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CountryRangeConfig {
    pub cidr: String,
    pub country: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TlsConfig {
    /// Fingerprint headers in order of preference.
    #[serde(default = "default_fingerprint_headers")]
    pub fingerprint_headers: Vec<String>,
    #[serde(default = "default_fingerprint_blacklist")]
    pub blacklist: Vec<String>,
    #[serde(default = "default_non_browser_prefixes")]
    pub non_browser_prefixes: Vec<String>,
    #[serde(default = "default_mismatch_penalty")]
    pub mismatch_penalty: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GraphqlConfig {
    #[serde(default = "default_graphql_path")]
    pub path: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_complexity")]
    pub max_complexity: u64,
    #[serde(default = "default_field_weight")]
    pub default_field_weight: u64,
    #[serde(default = "default_field_weights")]
    pub field_weights: BTreeMap<String, u64>,
    #[serde(default = "default_introspection_fields")]
    pub introspection_fields: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HeuristicsConfig {
    #[serde(default = "default_context_penalty")]
    pub missing_cookie_penalty: i32,
    #[serde(default = "default_context_penalty")]
    pub missing_referer_penalty: i32,
    #[serde(default = "default_cross_site_penalty")]
    pub cross_site_penalty: i32,
    #[serde(default = "default_small_bonus")]
    pub same_site_context_bonus: i32,
    #[serde(default = "default_context_penalty")]
    pub missing_content_type_penalty: i32,
    #[serde(default = "default_cross_site_penalty")]
    pub language_mismatch_penalty: i32,
    #[serde(default = "default_small_bonus")]
    pub language_match_bonus: i32,
    #[serde(default = "default_min_header_count")]
    pub min_header_count: usize,
    #[serde(default = "default_cross_site_penalty")]
    pub low_header_count_penalty: i32,
    #[serde(default = "default_rich_header_count")]
    pub rich_header_count: usize,
    #[serde(default = "default_small_bonus")]
    pub rich_headers_bonus: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScoringConfig {
    #[serde(default = "default_final_score_threshold")]
    pub final_score_threshold: i32,
    /// How far the heuristics stage may pull the score down.
    #[serde(default = "default_max_negative_bonus")]
    pub max_negative_bonus: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SchemaRuleConfig {
    pub path: String,
    pub methods: Vec<String>,
}

/// Front-end settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ProxyConfig {
    /// Take the client IP from `X-Forwarded-For`. Only enable behind a
    /// load balancer that overwrites the header; otherwise clients choose
    /// their own IP.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

// Default value functions
fn default_max_body_bytes() -> u64 {
    65536 // 64KB
}

fn default_suspicious_paths() -> Vec<String> {
    ["/wp-", "/.env", "/.git", "/phpmyadmin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ua_blacklist() -> Vec<String> {
    [
        "curl",
        "sqlmap",
        "python-requests",
        "wget",
        "nikto",
        "masscan",
        "go-http-client",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_missing_ua_penalty() -> i32 {
    30
}

fn default_incomplete_profile_penalty() -> i32 {
    20
}

fn default_client_hints_penalty() -> i32 {
    10
}

fn default_small_bonus() -> i32 {
    5
}

fn default_window_secs() -> f64 {
    60.0
}

fn default_ip_threshold() -> u32 {
    100
}

fn default_max_ip_track() -> usize {
    500_000
}

fn default_path_history() -> usize {
    16
}

fn default_language_expectations() -> BTreeMap<String, String> {
    [("KR", "ko"), ("JP", "ja"), ("CN", "zh"), ("DE", "de"), ("FR", "fr")]
        .iter()
        .map(|(c, l)| (c.to_string(), l.to_string()))
        .collect()
}

fn default_fingerprint_headers() -> Vec<String> {
    vec!["x-ja4".to_string(), "x-ja3".to_string()]
}

fn default_fingerprint_blacklist() -> Vec<String> {
    // curl's JA3 hash
    vec!["cd08e31494f04d93a41a9e1dc943e07b".to_string()]
}

fn default_non_browser_prefixes() -> Vec<String> {
    // JA4 prefixes of common HTTP libraries (HTTP/1.1 only ALPN)
    vec!["t13d1812h1".to_string(), "t13d3112h1".to_string()]
}

fn default_mismatch_penalty() -> i32 {
    25
}

fn default_graphql_path() -> String {
    "/graphql".to_string()
}

fn default_max_depth() -> usize {
    8
}

fn default_max_complexity() -> u64 {
    1000
}

fn default_field_weight() -> u64 {
    5
}

fn default_field_weights() -> BTreeMap<String, u64> {
    [("id", 1), ("name", 2)]
        .iter()
        .map(|(f, w)| (f.to_string(), *w))
        .collect()
}

fn default_introspection_fields() -> Vec<String> {
    vec!["__schema".to_string(), "__type".to_string()]
}

fn default_context_penalty() -> i32 {
    10
}

fn default_cross_site_penalty() -> i32 {
    15
}

fn default_min_header_count() -> usize {
    3
}

fn default_rich_header_count() -> usize {
    10
}

fn default_final_score_threshold() -> i32 {
    40
}

fn default_max_negative_bonus() -> i32 {
    20
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            suspicious_paths: default_suspicious_paths(),
        }
    }
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            blacklist: default_ua_blacklist(),
            missing_penalty: default_missing_ua_penalty(),
            incomplete_profile_penalty: default_incomplete_profile_penalty(),
            complete_profile_bonus: default_small_bonus(),
            client_hints_penalty: default_client_hints_penalty(),
            client_hints_bonus: default_small_bonus(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            ip_threshold: default_ip_threshold(),
            max_ip_track: default_max_ip_track(),
            path_history: default_path_history(),
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            blocked_countries: Vec::new(),
            language_expectations: default_language_expectations(),
            ranges: Vec::new(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            fingerprint_headers: default_fingerprint_headers(),
            blacklist: default_fingerprint_blacklist(),
            non_browser_prefixes: default_non_browser_prefixes(),
            mismatch_penalty: default_mismatch_penalty(),
        }
    }
}

impl Default for GraphqlConfig {
    fn default() -> Self {
        Self {
            path: default_graphql_path(),
            max_depth: default_max_depth(),
            max_complexity: default_max_complexity(),
            default_field_weight: default_field_weight(),
            field_weights: default_field_weights(),
            introspection_fields: default_introspection_fields(),
        }
    }
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            missing_cookie_penalty: default_context_penalty(),
            missing_referer_penalty: default_context_penalty(),
            cross_site_penalty: default_cross_site_penalty(),
            same_site_context_bonus: default_small_bonus(),
            missing_content_type_penalty: default_context_penalty(),
            language_mismatch_penalty: default_cross_site_penalty(),
            language_match_bonus: default_small_bonus(),
            min_header_count: default_min_header_count(),
            low_header_count_penalty: default_cross_site_penalty(),
            rich_header_count: default_rich_header_count(),
            rich_headers_bonus: default_small_bonus(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            final_score_threshold: default_final_score_threshold(),
            max_negative_bonus: default_max_negative_bonus(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let window = self.rate_limit.window_secs;
        if window.is_nan() || window <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.window_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.rate_limit.ip_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.ip_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.rate_limit.max_ip_track == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.max_ip_track",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scoring.final_score_threshold <= 0 {
            return Err(ConfigError::Invalid {
                field: "scoring.final_score_threshold",
                reason: "must be positive".to_string(),
            });
        }
        if self.scoring.max_negative_bonus < 0 {
            return Err(ConfigError::Invalid {
                field: "scoring.max_negative_bonus",
                reason: "must not be negative".to_string(),
            });
        }

        SchemaTable::from_config(&self.schema)?;
        CidrCountryResolver::from_config(&self.geo.ranges)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_body_bytes, 65536);
        assert_eq!(config.rate_limit.window_secs, 60.0);
        assert_eq!(config.rate_limit.ip_threshold, 100);
        assert_eq!(config.rate_limit.max_ip_track, 500_000);
        assert_eq!(config.rate_limit.path_history, 16);
        assert_eq!(config.graphql.max_depth, 8);
        assert_eq!(config.graphql.max_complexity, 1000);
        assert_eq!(config.graphql.field_weights.get("id"), Some(&1));
        assert_eq!(config.scoring.final_score_threshold, 40);
        assert_eq!(config.scoring.max_negative_bonus, 20);
        assert!(config.schema.is_empty());
        assert!(!config.proxy.trust_forwarded_for);
    }

    #[test]
    fn test_empty_yaml_yields_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let yaml = r#"
rate_limit:
  ip_threshold: 3
geo:
  blocked_countries: [CN, RU]
schema:
  - path: "/api/users/\\d+"
    methods: [get, delete]
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limit.ip_threshold, 3);
        assert_eq!(config.rate_limit.window_secs, 60.0);
        assert_eq!(config.geo.blocked_countries, vec!["CN", "RU"]);
        assert_eq!(config.geo.language_expectations.get("KR").map(String::as_str), Some("ko"));
        assert_eq!(config.schema.len(), 1);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let result = EngineConfig::from_yaml("rate_limit:\n  ip_threshold: 0\n");
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "rate_limit.ip_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_bad_schema_pattern_rejected() {
        let yaml = "schema:\n  - path: \"/api/(\"\n    methods: [get]\n";
        assert!(matches!(
            EngineConfig::from_yaml(yaml),
            Err(ConfigError::SchemaPattern { .. })
        ));
    }

    #[test]
    fn test_bad_country_range_rejected() {
        let yaml = "geo:\n  ranges:\n    - cidr: 10.0.0.0/33\n      country: KR\n";
        assert!(matches!(
            EngineConfig::from_yaml(yaml),
            Err(ConfigError::CountryRange { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            EngineConfig::from_file("nonexistent.yaml"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_sample_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/engine.yaml");
        let config = EngineConfig::from_file(path).unwrap();
        assert_eq!(config.scoring.final_score_threshold, 40);
        assert_eq!(config.rate_limit.path_history, 16);
    }

    #[test]
    fn test_forwarded_for_trust_is_opt_in() {
        let config = EngineConfig::from_yaml("proxy:\n  trust_forwarded_for: true\n").unwrap();
        assert!(config.proxy.trust_forwarded_for);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
    }
}
