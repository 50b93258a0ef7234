use super::{
    AnomalyClassifier, Attribution, CidrCountryResolver, CountryResolver, Decision,
    DerivedFeatures, DetectionStage, GeoStage, GraphqlParser, GraphqlStage, HeuristicsStage,
    IpStateStore, LightRejectStage, RateLimitStage, RequestRecord, SchemaTable, ScoreAccumulator,
    SelectionSetParser, StageContext, StageResult, TlsFingerprintStage, UserAgentStage,
};
use crate::config::{ConfigError, EngineConfig};
use log::{debug, error, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Ordered multi-stage request evaluator.
///
/// Stages run in a fixed order: light reject, User-Agent profile, IP rate,
/// country, TLS fingerprint, GraphQL, header heuristics. The first block
/// ends the evaluation. Otherwise the summed score is compared against the
/// configured threshold, and requests still allowed are offered to the
/// classifier, if one is installed.
///
/// `evaluate` takes `&self` and may be called from any number of threads.
pub struct DecisionEngine {
    config: EngineConfig,
    store: Arc<IpStateStore>,
    stages: Vec<Box<dyn DetectionStage>>,
    classifier: Option<Arc<dyn AnomalyClassifier>>,
}

/// Collects the collaborators of a [`DecisionEngine`]. Anything not supplied
/// is built from the config: range-table resolver, schema table, built-in
/// GraphQL parser, and no classifier.
pub struct DecisionEngineBuilder {
    config: EngineConfig,
    resolver: Option<Arc<dyn CountryResolver>>,
    schema: Option<Arc<SchemaTable>>,
    parser: Option<Arc<dyn GraphqlParser>>,
    classifier: Option<Arc<dyn AnomalyClassifier>>,
}

impl DecisionEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            resolver: None,
            schema: None,
            parser: None,
            classifier: None,
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn CountryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn schema(mut self, schema: SchemaTable) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    pub fn parser(mut self, parser: Arc<dyn GraphqlParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn AnomalyClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> Result<DecisionEngine, ConfigError> {
        let config = self.config;
        config.validate()?;

        let resolver: Arc<dyn CountryResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(CidrCountryResolver::from_config(&config.geo.ranges)?),
        };
        let schema = match self.schema {
            Some(schema) => schema,
            None => Arc::new(SchemaTable::from_config(&config.schema)?),
        };
        let parser: Arc<dyn GraphqlParser> = match self.parser {
            Some(parser) => parser,
            None => Arc::new(SelectionSetParser),
        };
        let store = Arc::new(IpStateStore::from_config(&config.rate_limit));

        let stages: Vec<Box<dyn DetectionStage>> = vec![
            Box::new(LightRejectStage::new(&config.limits, schema)),
            Box::new(UserAgentStage::new(&config.user_agent)),
            Box::new(RateLimitStage::new(store.clone())),
            Box::new(GeoStage::new(resolver, &config.geo)),
            Box::new(TlsFingerprintStage::new(&config.tls)),
            Box::new(GraphqlStage::new(parser, &config.graphql)),
            Box::new(HeuristicsStage::new(
                &config.heuristics,
                &config.geo,
                &config.scoring,
            )),
        ];

        Ok(DecisionEngine {
            config,
            store,
            stages,
            classifier: self.classifier,
        })
    }
}

impl DecisionEngine {
    /// Engine with every collaborator derived from `config`.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        DecisionEngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> DecisionEngineBuilder {
        DecisionEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-IP counters shared with the rate stage.
    pub fn store(&self) -> &Arc<IpStateStore> {
        &self.store
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn evaluate(&self, request: &RequestRecord) -> Decision {
        let mut ctx = StageContext::new(request.now());
        let mut score = ScoreAccumulator::new();

        for stage in &self.stages {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| stage.evaluate(request, &mut ctx)));
            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        "Stage {} panicked on request from {}, skipping it",
                        stage.name(),
                        request.ip
                    );
                    continue;
                }
            };

            match result {
                StageResult::Pass => {
                    debug!("{}: pass", stage.name());
                }
                StageResult::Score(delta) => {
                    let applied = match stage.negative_bound() {
                        Some(bound) => score.add_bounded(delta, bound),
                        None => {
                            score.add(delta);
                            delta
                        }
                    };
                    debug!(
                        "{}: score {:+} (running total {})",
                        stage.name(),
                        applied,
                        score.total()
                    );
                }
                StageResult::Block {
                    attribution,
                    reason,
                } => {
                    warn!(
                        "Request from {} blocked by {}: {}",
                        request.ip,
                        stage.name(),
                        reason
                    );
                    return Decision::blocked(attribution, score.total(), reason);
                }
            }
        }

        let threshold = self.config.scoring.final_score_threshold;
        if score.reaches(threshold) {
            warn!(
                "Request from {} reached anomaly score {} (+{} / {}, threshold {})",
                request.ip,
                score.total(),
                score.positive(),
                score.negative(),
                threshold
            );
            return Decision::blocked(
                Attribution::ScoreThreshold,
                score.total(),
                format!("Anomaly score {} reached threshold {}", score.total(), threshold),
            );
        }

        self.escalate(request, score.total())
    }

    /// Offer an allowed request to the classifier. Any failure allows.
    fn escalate(&self, request: &RequestRecord, score: i32) -> Decision {
        let classifier = match &self.classifier {
            Some(classifier) => classifier,
            None => return Decision::allowed(score),
        };

        let snapshot = self.store.snapshot(&request.ip);
        let features = DerivedFeatures::from_snapshot(snapshot, &request.path);
        let verdict = panic::catch_unwind(AssertUnwindSafe(|| classifier.classify(request, &features)));
        match verdict {
            Ok(Ok(true)) => {
                warn!("Classifier flagged request from {}", request.ip);
                Decision::blocked(Attribution::Ml, score, "Flagged by anomaly classifier")
            }
            Ok(Ok(false)) => Decision::allowed(score),
            Ok(Err(e)) => {
                warn!("Classifier failed for {}, allowing: {}", request.ip, e);
                Decision::allowed(score)
            }
            Err(_) => {
                error!("Classifier panicked on request from {}, allowing", request.ip);
                Decision::allowed(score)
            }
        }
    }
}
