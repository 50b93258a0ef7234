use super::{DetectionStage, RequestRecord, StageContext, StageResult};
use crate::config::{GeoConfig, HeuristicsConfig, ScoringConfig};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

// Primary subtag of each Accept-Language entry: "ko-KR;q=0.9" -> "ko"
static LANGUAGE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|,)\s*([A-Za-z]{1,8})(?:-[A-Za-z0-9]{1,8})*").unwrap());

const MUTATING_METHODS: &[&str] = &["post", "put", "patch"];

/// Primary language subtags listed in an Accept-Language header, lowercased.
pub fn accepted_languages(header: &str) -> Vec<String> {
    LANGUAGE_TAG
        .captures_iter(header)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect()
}

/// Stage 6: residual header heuristics. Score only, never blocks.
pub struct HeuristicsStage {
    config: HeuristicsConfig,
    language_expectations: BTreeMap<String, String>,
    max_negative_bonus: i32,
}

impl HeuristicsStage {
    pub fn new(config: &HeuristicsConfig, geo: &GeoConfig, scoring: &ScoringConfig) -> Self {
        Self {
            config: config.clone(),
            language_expectations: geo
                .language_expectations
                .iter()
                .map(|(country, lang)| (country.to_ascii_uppercase(), lang.to_ascii_lowercase()))
                .collect(),
            max_negative_bonus: scoring.max_negative_bonus,
        }
    }

    fn same_site_delta(&self, request: &RequestRecord) -> i32 {
        if !request.same_site {
            return 0;
        }

        let headers = &request.headers;
        let has_cookie = headers.has("cookie");
        let has_referer = headers.has("referer");
        let mut delta = 0;

        if !has_cookie {
            delta += self.config.missing_cookie_penalty;
        }
        if !has_referer {
            delta += self.config.missing_referer_penalty;
        }
        if headers
            .get("sec-fetch-site")
            .map_or(false, |v| v.trim().eq_ignore_ascii_case("cross-site"))
        {
            delta += self.config.cross_site_penalty;
        }
        if has_cookie && has_referer {
            delta -= self.config.same_site_context_bonus;
        }
        delta
    }

    fn content_type_delta(&self, request: &RequestRecord) -> i32 {
        let mutating = MUTATING_METHODS
            .iter()
            .any(|m| m.eq_ignore_ascii_case(request.method.trim()));
        if mutating && request.body_length > 0 && !request.headers.has("content-type") {
            self.config.missing_content_type_penalty
        } else {
            0
        }
    }

    fn language_delta(&self, request: &RequestRecord, country: Option<&str>) -> i32 {
        let expected = match country.and_then(|c| self.language_expectations.get(c)) {
            Some(lang) => lang,
            None => return 0,
        };
        let header = match request.headers.get("accept-language") {
            Some(v) if !v.trim().is_empty() => v,
            _ => return 0,
        };

        if accepted_languages(header).iter().any(|lang| lang == expected) {
            -self.config.language_match_bonus
        } else {
            self.config.language_mismatch_penalty
        }
    }

    fn header_count_delta(&self, request: &RequestRecord) -> i32 {
        let count = request.headers.len();
        if count < self.config.min_header_count {
            self.config.low_header_count_penalty
        } else if count >= self.config.rich_header_count {
            -self.config.rich_headers_bonus
        } else {
            0
        }
    }
}

impl DetectionStage for HeuristicsStage {
    fn evaluate(&self, request: &RequestRecord, ctx: &mut StageContext) -> StageResult {
        let delta = self.same_site_delta(request)
            + self.content_type_delta(request)
            + self.language_delta(request, ctx.country.as_deref())
            + self.header_count_delta(request);

        debug!("Heuristics delta for {}: {}", request.ip, delta);
        if delta == 0 {
            StageResult::Pass
        } else {
            StageResult::Score(delta)
        }
    }

    fn name(&self) -> &str {
        "Header Heuristics"
    }

    fn negative_bound(&self) -> Option<i32> {
        Some(self.max_negative_bonus)
    }
}
