use super::{IpSnapshot, RequestRecord};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classification failed: {0}")]
    Failed(String),
}

/// Per-IP history handed to the classifier. Read-only copy of the store's
/// counters taken after the current request was recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedFeatures {
    pub request_count: u32,
    pub window_start: f64,
    /// Seconds since this IP's previous request, if there was one.
    pub interval_secs: Option<f64>,
    /// This IP's latest paths, oldest first, current request included.
    pub recent_paths: Vec<String>,
    /// Occurrences of the current path in `recent_paths`.
    pub path_hits: usize,
}

impl DerivedFeatures {
    pub fn from_snapshot(snapshot: Option<IpSnapshot>, path: &str) -> Self {
        match snapshot {
            Some(s) => Self {
                request_count: s.count,
                window_start: s.window_start,
                interval_secs: s.interval_secs(),
                path_hits: s.path_hits(path),
                recent_paths: s.recent_paths,
            },
            None => Self::default(),
        }
    }
}

/// Second-opinion hook consulted only for requests the rules allowed.
pub trait AnomalyClassifier: Send + Sync {
    fn classify(
        &self,
        request: &RequestRecord,
        features: &DerivedFeatures,
    ) -> Result<bool, ClassifierError>;
}

/// Never escalates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClassifier;

impl AnomalyClassifier for NoopClassifier {
    fn classify(
        &self,
        _request: &RequestRecord,
        _features: &DerivedFeatures,
    ) -> Result<bool, ClassifierError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_from_snapshot() {
        let snapshot = IpSnapshot {
            count: 4,
            window_start: 100.0,
            last_seen: 103.5,
            previous_seen: Some(102.0),
            recent_paths: vec!["/cart".to_string(), "/".to_string(), "/cart".to_string()],
        };
        let features = DerivedFeatures::from_snapshot(Some(snapshot), "/cart");
        assert_eq!(features.request_count, 4);
        assert_eq!(features.window_start, 100.0);
        assert_eq!(features.interval_secs, Some(1.5));
        assert_eq!(features.recent_paths.len(), 3);
        assert_eq!(features.path_hits, 2);
    }

    #[test]
    fn test_untracked_ip_has_empty_features() {
        let features = DerivedFeatures::from_snapshot(None, "/");
        assert_eq!(features, DerivedFeatures::default());
    }

    #[test]
    fn test_noop_never_escalates() {
        let request = RequestRecord::new("5.5.5.5", "get", "/");
        let verdict = NoopClassifier.classify(&request, &DerivedFeatures::default());
        assert!(!verdict.unwrap());
    }
}
