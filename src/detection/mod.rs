pub mod classifier;
pub mod country;
pub mod engine;
pub mod geo;
pub mod graphql;
pub mod heuristics;
pub mod light_reject;
pub mod rate_limiter;
pub mod request;
pub mod schema;
pub mod score;
pub mod tls_fingerprint;
pub mod user_agent;

pub use classifier::*;
pub use country::*;
pub use engine::*;
pub use geo::*;
pub use graphql::*;
pub use heuristics::*;
pub use light_reject::*;
pub use rate_limiter::*;
pub use request::*;
pub use schema::*;
pub use score::*;
pub use tls_fingerprint::*;
pub use user_agent::*;

use serde::Serialize;
use std::fmt;

/// Which part of the engine produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Attribution {
    LightReject,
    UaBlacklist,
    IpRate,
    Geo,
    #[serde(rename = "tls-fp")]
    TlsFingerprint,
    Graphql,
    ScoreThreshold,
    Ml,
    Normal,
}

impl Attribution {
    pub const ALL: [Attribution; 9] = [
        Attribution::LightReject,
        Attribution::UaBlacklist,
        Attribution::IpRate,
        Attribution::Geo,
        Attribution::TlsFingerprint,
        Attribution::Graphql,
        Attribution::ScoreThreshold,
        Attribution::Ml,
        Attribution::Normal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Attribution::LightReject => "light-reject",
            Attribution::UaBlacklist => "ua-blacklist",
            Attribution::IpRate => "ip-rate",
            Attribution::Geo => "geo",
            Attribution::TlsFingerprint => "tls-fp",
            Attribution::Graphql => "graphql",
            Attribution::ScoreThreshold => "score-threshold",
            Attribution::Ml => "ml",
            Attribution::Normal => "normal",
        }
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Pass,
    Block {
        attribution: Attribution,
        reason: String,
    },
    Score(i32),
}

impl StageResult {
    pub fn block(attribution: Attribution, reason: impl Into<String>) -> Self {
        StageResult::Block {
            attribution,
            reason: reason.into(),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, StageResult::Block { .. })
    }
}

/// Per-evaluation scratch space shared by the stages of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub now: f64,
    /// Set by the geo stage when the resolver knows the client's country.
    pub country: Option<String>,
}

impl StageContext {
    pub fn new(now: f64) -> Self {
        Self { now, country: None }
    }
}

/// One step of the detection pipeline.
pub trait DetectionStage: Send + Sync {
    fn evaluate(&self, request: &RequestRecord, ctx: &mut StageContext) -> StageResult;

    fn name(&self) -> &str;

    /// Upper bound on how far this stage may lower the running score.
    /// `None` means negative deltas are taken as-is.
    fn negative_bound(&self) -> Option<i32> {
        None
    }
}

/// Final verdict for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub anomalous: bool,
    pub attribution: Attribution,
    pub score: i32,
    pub reason: Option<String>,
}

impl Decision {
    pub fn blocked(attribution: Attribution, score: i32, reason: impl Into<String>) -> Self {
        Self {
            anomalous: true,
            attribution,
            score,
            reason: Some(reason.into()),
        }
    }

    pub fn allowed(score: i32) -> Self {
        Self {
            anomalous: false,
            attribution: Attribution::Normal,
            score,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribution_wire_names() {
        let names: Vec<&str> = Attribution::ALL.iter().map(|a| a.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "light-reject",
                "ua-blacklist",
                "ip-rate",
                "geo",
                "tls-fp",
                "graphql",
                "score-threshold",
                "ml",
                "normal"
            ]
        );
        assert_eq!(Attribution::TlsFingerprint.to_string(), "tls-fp");
    }

    #[test]
    fn test_serialized_attribution_uses_wire_names() {
        for attribution in Attribution::ALL {
            let json = serde_json::to_string(&attribution).unwrap();
            assert_eq!(json, format!("\"{}\"", attribution.as_str()));
        }
    }

    #[test]
    fn test_allowed_decision_is_normal() {
        let decision = Decision::allowed(12);
        assert!(!decision.anomalous);
        assert_eq!(decision.attribution, Attribution::Normal);
        assert!(decision.reason.is_none());
    }
}
