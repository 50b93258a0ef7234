use super::{Attribution, DetectionStage, HeaderMap, RequestRecord, StageContext, StageResult};
use crate::config::UserAgentConfig;
use log::{debug, warn};

const FETCH_METADATA: &[&str] = &["sec-fetch-site", "sec-fetch-mode", "sec-fetch-dest"];
const CHROMIUM_REQUIRED: &[&str] = &["sec-fetch-site", "sec-fetch-mode", "sec-fetch-dest", "sec-ch-ua"];
const CLIENT_HINTS: &[&str] = &["sec-ch-ua-mobile", "sec-ch-ua-platform"];

/// Browser family claimed by a User-Agent string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserProfile {
    Edge,
    Chrome,
    Safari,
    Firefox,
}

impl BrowserProfile {
    /// Detect the claimed browser.
    ///
    /// Tokens overlap (Edge UAs also carry "chrome", Chrome UAs carry
    /// "safari"), so the check order edge, chrome, safari, firefox is
    /// significant.
    pub fn detect(user_agent: &str) -> Option<Self> {
        let ua = user_agent.to_ascii_lowercase();
        if ua.contains("edg/") || ua.contains("edge/") {
            Some(BrowserProfile::Edge)
        } else if ua.contains("chrome") || ua.contains("crios") {
            Some(BrowserProfile::Chrome)
        } else if ua.contains("safari") {
            Some(BrowserProfile::Safari)
        } else if ua.contains("firefox") {
            Some(BrowserProfile::Firefox)
        } else {
            None
        }
    }

    pub fn required_headers(&self) -> &'static [&'static str] {
        match self {
            BrowserProfile::Edge | BrowserProfile::Chrome => CHROMIUM_REQUIRED,
            BrowserProfile::Safari | BrowserProfile::Firefox => FETCH_METADATA,
        }
    }

    pub fn is_chromium(&self) -> bool {
        matches!(self, BrowserProfile::Edge | BrowserProfile::Chrome)
    }
}

/// Stage 1: User-Agent blacklist and browser header profile.
pub struct UserAgentStage {
    blacklist: Vec<String>,
    missing_penalty: i32,
    incomplete_profile_penalty: i32,
    complete_profile_bonus: i32,
    client_hints_penalty: i32,
    client_hints_bonus: i32,
}

impl UserAgentStage {
    pub fn new(config: &UserAgentConfig) -> Self {
        Self {
            blacklist: config
                .blacklist
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            missing_penalty: config.missing_penalty,
            incomplete_profile_penalty: config.incomplete_profile_penalty,
            complete_profile_bonus: config.complete_profile_bonus,
            client_hints_penalty: config.client_hints_penalty,
            client_hints_bonus: config.client_hints_bonus,
        }
    }

    /// Blacklisted token contained in `user_agent`, if any.
    pub fn blacklisted_token(&self, user_agent: &str) -> Option<&str> {
        let ua = user_agent.to_ascii_lowercase();
        self.blacklist
            .iter()
            .find(|token| ua.contains(token.as_str()))
            .map(String::as_str)
    }

    fn profile_score(&self, profile: BrowserProfile, headers: &HeaderMap) -> i32 {
        let complete = profile.required_headers().iter().all(|h| headers.has(h));
        let mut delta = if complete {
            -self.complete_profile_bonus
        } else {
            self.incomplete_profile_penalty
        };

        if profile.is_chromium() {
            let present = CLIENT_HINTS.iter().filter(|h| headers.has(h)).count();
            if present == CLIENT_HINTS.len() {
                delta -= self.client_hints_bonus;
            } else if present == 0 {
                delta += self.client_hints_penalty;
            }
        }
        delta
    }
}

impl DetectionStage for UserAgentStage {
    fn evaluate(&self, request: &RequestRecord, _ctx: &mut StageContext) -> StageResult {
        let user_agent = match request.user_agent() {
            Some(ua) if !ua.trim().is_empty() => ua,
            _ => {
                debug!("Missing User-Agent from {}", request.ip);
                return StageResult::Score(self.missing_penalty);
            }
        };

        if let Some(token) = self.blacklisted_token(user_agent) {
            warn!("Blacklisted User-Agent from {}: {}", request.ip, user_agent);
            return StageResult::block(
                Attribution::UaBlacklist,
                format!("User-Agent matches blacklisted token {}", token),
            );
        }

        match BrowserProfile::detect(user_agent) {
            Some(profile) => StageResult::Score(self.profile_score(profile, &request.headers)),
            None => StageResult::Pass,
        }
    }

    fn name(&self) -> &str {
        "User-Agent Profile"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const EDGE_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";
    const SAFARI_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15";
    const FIREFOX_UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

    fn stage() -> UserAgentStage {
        UserAgentStage::new(&UserAgentConfig::default())
    }

    fn evaluate(request: &RequestRecord) -> StageResult {
        stage().evaluate(request, &mut StageContext::new(0.0))
    }

    fn with_fetch_metadata(request: RequestRecord) -> RequestRecord {
        request
            .with_header("Sec-Fetch-Site", "same-origin")
            .with_header("Sec-Fetch-Mode", "navigate")
            .with_header("Sec-Fetch-Dest", "document")
    }

    #[test]
    fn test_profile_precedence() {
        assert_eq!(BrowserProfile::detect(EDGE_UA), Some(BrowserProfile::Edge));
        assert_eq!(BrowserProfile::detect(CHROME_UA), Some(BrowserProfile::Chrome));
        assert_eq!(BrowserProfile::detect(SAFARI_UA), Some(BrowserProfile::Safari));
        assert_eq!(BrowserProfile::detect(FIREFOX_UA), Some(BrowserProfile::Firefox));
        assert_eq!(BrowserProfile::detect("Mozilla/5.0"), None);
    }

    #[test]
    fn test_missing_ua_penalty() {
        let request = RequestRecord::new("1.1.1.1", "get", "/");
        assert_eq!(evaluate(&request), StageResult::Score(30));

        let blank = RequestRecord::new("1.1.1.1", "get", "/").with_header("User-Agent", " ");
        assert_eq!(evaluate(&blank), StageResult::Score(30));
    }

    #[test]
    fn test_blacklisted_ua_blocks() {
        for ua in ["curl/8.1", "sqlmap/1.7", "python-requests/2.31", "Wget/1.21"] {
            let request = RequestRecord::new("1.1.1.1", "get", "/").with_header("User-Agent", ua);
            assert!(
                matches!(
                    evaluate(&request),
                    StageResult::Block { attribution: Attribution::UaBlacklist, .. }
                ),
                "{} should be blacklisted",
                ua
            );
        }
    }

    #[test]
    fn test_blacklist_beats_complete_profile() {
        let request = with_fetch_metadata(RequestRecord::new("1.1.1.1", "get", "/"))
            .with_header("User-Agent", &format!("{} curl", CHROME_UA))
            .with_header("sec-ch-ua", "\"Chromium\";v=\"120\"")
            .with_header("sec-ch-ua-mobile", "?0")
            .with_header("sec-ch-ua-platform", "\"Windows\"");
        assert!(evaluate(&request).is_block());
    }

    #[test]
    fn test_complete_chrome_profile_earns_bonus() {
        let request = with_fetch_metadata(RequestRecord::new("1.1.1.1", "get", "/"))
            .with_header("User-Agent", CHROME_UA)
            .with_header("sec-ch-ua", "\"Chromium\";v=\"120\"")
            .with_header("sec-ch-ua-mobile", "?0")
            .with_header("sec-ch-ua-platform", "\"Windows\"");
        assert_eq!(evaluate(&request), StageResult::Score(-10));
    }

    #[test]
    fn test_bare_chrome_profile_is_penalized() {
        let request = RequestRecord::new("1.1.1.1", "get", "/").with_header("User-Agent", CHROME_UA);
        assert_eq!(evaluate(&request), StageResult::Score(30));
    }

    #[test]
    fn test_partial_client_hints_are_neutral() {
        let request = with_fetch_metadata(RequestRecord::new("1.1.1.1", "get", "/"))
            .with_header("User-Agent", EDGE_UA)
            .with_header("sec-ch-ua", "\"Microsoft Edge\";v=\"120\"")
            .with_header("sec-ch-ua-mobile", "?0");
        assert_eq!(evaluate(&request), StageResult::Score(-5));
    }

    #[test]
    fn test_firefox_ignores_client_hints() {
        let complete = with_fetch_metadata(RequestRecord::new("1.1.1.1", "get", "/"))
            .with_header("User-Agent", FIREFOX_UA);
        assert_eq!(evaluate(&complete), StageResult::Score(-5));

        let incomplete = RequestRecord::new("1.1.1.1", "get", "/").with_header("User-Agent", FIREFOX_UA);
        assert_eq!(evaluate(&incomplete), StageResult::Score(20));
    }

    #[test]
    fn test_unrecognized_ua_passes() {
        let request = RequestRecord::new("1.1.1.1", "get", "/").with_header("User-Agent", "Mozilla/5.0");
        assert_eq!(evaluate(&request), StageResult::Pass);
    }
}
