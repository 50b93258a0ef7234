use super::{Attribution, DetectionStage, RequestRecord, StageContext, StageResult};
use crate::config::TlsConfig;
use log::{debug, warn};
use std::collections::HashSet;

/// Stage 4: TLS client fingerprint reported by the edge.
///
/// Plain HTTP requests carry no fingerprint header and pass untouched.
pub struct TlsFingerprintStage {
    headers: Vec<String>,
    blacklist: HashSet<String>,
    non_browser_prefixes: Vec<String>,
    mismatch_penalty: i32,
}

impl TlsFingerprintStage {
    pub fn new(config: &TlsConfig) -> Self {
        Self {
            headers: config
                .fingerprint_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            blacklist: config
                .blacklist
                .iter()
                .map(|f| f.trim().to_ascii_lowercase())
                .collect(),
            non_browser_prefixes: config
                .non_browser_prefixes
                .iter()
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            mismatch_penalty: config.mismatch_penalty,
        }
    }

    /// First configured fingerprint header present on the request.
    pub fn fingerprint<'a>(&self, request: &'a RequestRecord) -> Option<(&'a str, String)> {
        self.headers.iter().find_map(|name| {
            request
                .headers
                .get(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (v, name.clone()))
        })
    }
}

fn claims_browser(user_agent: Option<&str>) -> bool {
    user_agent.map_or(false, |ua| ua.to_ascii_lowercase().contains("mozilla/"))
}

impl DetectionStage for TlsFingerprintStage {
    fn evaluate(&self, request: &RequestRecord, _ctx: &mut StageContext) -> StageResult {
        let (fingerprint, header) = match self.fingerprint(request) {
            Some(found) => found,
            None => return StageResult::Pass,
        };
        let fingerprint = fingerprint.to_ascii_lowercase();

        if self.blacklist.contains(&fingerprint) {
            warn!("Blacklisted TLS fingerprint from {}: {}", request.ip, fingerprint);
            return StageResult::block(
                Attribution::TlsFingerprint,
                format!("Blacklisted TLS fingerprint in {}: {}", header, fingerprint),
            );
        }

        let non_browser = self
            .non_browser_prefixes
            .iter()
            .any(|prefix| fingerprint.starts_with(prefix.as_str()));
        if non_browser && claims_browser(request.user_agent()) {
            debug!(
                "Browser User-Agent with library TLS fingerprint from {}: {}",
                request.ip, fingerprint
            );
            return StageResult::Score(self.mismatch_penalty);
        }

        StageResult::Pass
    }

    fn name(&self) -> &str {
        "TLS Fingerprint"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluate(request: &RequestRecord) -> StageResult {
        TlsFingerprintStage::new(&TlsConfig::default()).evaluate(request, &mut StageContext::new(0.0))
    }

    #[test]
    fn test_absent_fingerprint_passes() {
        let request = RequestRecord::new("2.2.2.2", "get", "/").with_header("User-Agent", "Mozilla/5.0");
        assert_eq!(evaluate(&request), StageResult::Pass);
    }

    #[test]
    fn test_blacklisted_fingerprint_blocks() {
        let request = RequestRecord::new("2.2.2.2", "get", "/")
            .with_header("X-JA3", "CD08E31494F04D93A41A9E1DC943E07B");
        assert!(matches!(
            evaluate(&request),
            StageResult::Block { attribution: Attribution::TlsFingerprint, .. }
        ));
    }

    #[test]
    fn test_ja4_preferred_over_ja3() {
        let stage = TlsFingerprintStage::new(&TlsConfig::default());
        let request = RequestRecord::new("2.2.2.2", "get", "/")
            .with_header("x-ja3", "cd08e31494f04d93a41a9e1dc943e07b")
            .with_header("x-ja4", "t13d1516h2_8daaf6152771_02713d6af862");
        let (value, header) = stage.fingerprint(&request).unwrap();
        assert_eq!(header, "x-ja4");
        assert!(value.starts_with("t13d1516h2"));
        // the blacklisted JA3 is never consulted
        assert_eq!(evaluate(&request), StageResult::Pass);
    }

    #[test]
    fn test_browser_ua_with_library_fingerprint_is_scored() {
        let request = RequestRecord::new("2.2.2.2", "get", "/")
            .with_header("User-Agent", "Mozilla/5.0 (Windows NT 10.0) Chrome/120.0")
            .with_header("x-ja4", "t13d1812h1_85036bcba153_375ca2c5e164");
        assert_eq!(evaluate(&request), StageResult::Score(25));
    }

    #[test]
    fn test_library_fingerprint_without_browser_claim_passes() {
        let request = RequestRecord::new("2.2.2.2", "get", "/")
            .with_header("User-Agent", "my-service/1.0")
            .with_header("x-ja4", "t13d1812h1_85036bcba153_375ca2c5e164");
        assert_eq!(evaluate(&request), StageResult::Pass);
    }
}
