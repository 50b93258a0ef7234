use super::{Attribution, CountryResolver, DetectionStage, RequestRecord, StageContext, StageResult};
use crate::config::GeoConfig;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Stage 3: country block list.
///
/// Fails open: an empty IP, an unknown country or a resolver error all pass.
/// A resolved country is kept in the context for the heuristics stage.
pub struct GeoStage {
    resolver: Arc<dyn CountryResolver>,
    blocked: HashSet<String>,
}

impl GeoStage {
    pub fn new(resolver: Arc<dyn CountryResolver>, config: &GeoConfig) -> Self {
        Self {
            resolver,
            blocked: config
                .blocked_countries
                .iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .collect(),
        }
    }
}

impl DetectionStage for GeoStage {
    fn evaluate(&self, request: &RequestRecord, ctx: &mut StageContext) -> StageResult {
        if request.ip.is_empty() {
            return StageResult::Pass;
        }

        let country = match self.resolver.resolve(&request.ip) {
            Ok(Some(country)) => country.trim().to_ascii_uppercase(),
            Ok(None) => return StageResult::Pass,
            Err(e) => {
                warn!("Country lookup for {} failed, skipping: {}", request.ip, e);
                return StageResult::Pass;
            }
        };

        debug!("Resolved {} to {}", request.ip, country);
        let result = if self.blocked.contains(&country) {
            StageResult::block(
                Attribution::Geo,
                format!("Requests from {} are blocked", country),
            )
        } else {
            StageResult::Pass
        };
        ctx.country = Some(country);
        result
    }

    fn name(&self) -> &str {
        "Country Block"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{CidrCountryResolver, NoopResolver, ResolveError};

    struct FailingResolver;

    impl CountryResolver for FailingResolver {
        fn resolve(&self, _ip: &str) -> Result<Option<String>, ResolveError> {
            Err(ResolveError::Unavailable("geo database offline".to_string()))
        }
    }

    fn blocking_config(countries: &[&str]) -> GeoConfig {
        GeoConfig {
            blocked_countries: countries.iter().map(|c| c.to_string()).collect(),
            ..GeoConfig::default()
        }
    }

    fn cn_resolver() -> Arc<dyn CountryResolver> {
        let mut resolver = CidrCountryResolver::new();
        resolver.add_range("1.12.0.0/14", "CN").unwrap();
        resolver.add_range("8.8.8.0/24", "US").unwrap();
        Arc::new(resolver)
    }

    #[test]
    fn test_blocked_country() {
        let stage = GeoStage::new(cn_resolver(), &blocking_config(&["cn"]));
        let mut ctx = StageContext::new(0.0);
        let result = stage.evaluate(&RequestRecord::new("1.12.1.1", "get", "/"), &mut ctx);

        assert!(matches!(
            result,
            StageResult::Block {
                attribution: Attribution::Geo,
                ..
            }
        ));
        assert_eq!(ctx.country.as_deref(), Some("CN"));
    }

    #[test]
    fn test_allowed_country_is_remembered() {
        let stage = GeoStage::new(cn_resolver(), &blocking_config(&["CN"]));
        let mut ctx = StageContext::new(0.0);
        let result = stage.evaluate(&RequestRecord::new("8.8.8.8", "get", "/"), &mut ctx);

        assert_eq!(result, StageResult::Pass);
        assert_eq!(ctx.country.as_deref(), Some("US"));
    }

    #[test]
    fn test_failing_resolver_never_blocks() {
        let stage = GeoStage::new(Arc::new(FailingResolver), &blocking_config(&["CN", "US"]));
        for ip in ["1.12.1.1", "8.8.8.8", "::1", "garbage", ""] {
            let mut ctx = StageContext::new(0.0);
            let result = stage.evaluate(&RequestRecord::new(ip, "get", "/"), &mut ctx);
            assert_eq!(result, StageResult::Pass);
            assert!(ctx.country.is_none());
        }
    }

    #[test]
    fn test_unknown_country_passes() {
        let stage = GeoStage::new(Arc::new(NoopResolver), &blocking_config(&["CN"]));
        let mut ctx = StageContext::new(0.0);
        let result = stage.evaluate(&RequestRecord::new("1.12.1.1", "get", "/"), &mut ctx);
        assert_eq!(result, StageResult::Pass);
    }
}
