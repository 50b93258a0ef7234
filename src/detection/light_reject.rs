use super::{
    Attribution, DetectionStage, RequestRecord, SchemaTable, SchemaVerdict, StageContext,
    StageResult,
};
use crate::config::LimitsConfig;
use std::sync::Arc;

/// Stage 0: cheap structural rejects.
///
/// Oversized bodies, scanner paths such as `/.env`, and, when a schema table is
/// loaded, any path/method pair outside it.
pub struct LightRejectStage {
    max_body_bytes: u64,
    suspicious_paths: Vec<String>,
    schema: Arc<SchemaTable>,
}

impl LightRejectStage {
    pub fn new(config: &LimitsConfig, schema: Arc<SchemaTable>) -> Self {
        Self {
            max_body_bytes: config.max_body_bytes,
            suspicious_paths: config
                .suspicious_paths
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            schema,
        }
    }

    fn suspicious_token(&self, path: &str) -> Option<&str> {
        let path = path.to_ascii_lowercase();
        self.suspicious_paths
            .iter()
            .find(|token| path.contains(token.as_str()))
            .map(String::as_str)
    }
}

impl DetectionStage for LightRejectStage {
    fn evaluate(&self, request: &RequestRecord, _ctx: &mut StageContext) -> StageResult {
        if request.body_length > self.max_body_bytes {
            return StageResult::block(
                Attribution::LightReject,
                format!(
                    "Request body of {} bytes exceeds maximum size of {} bytes",
                    request.body_length, self.max_body_bytes
                ),
            );
        }

        if let Some(token) = self.suspicious_token(&request.path) {
            return StageResult::block(
                Attribution::LightReject,
                format!("Path contains suspicious token {}", token),
            );
        }

        match self.schema.check(&request.path, &request.method) {
            SchemaVerdict::Skipped | SchemaVerdict::Allowed => StageResult::Pass,
            SchemaVerdict::UnknownPath => StageResult::block(
                Attribution::LightReject,
                format!("Path {} is not in the API schema", request.path),
            ),
            SchemaVerdict::MethodNotAllowed => StageResult::block(
                Attribution::LightReject,
                format!(
                    "Method {} not allowed for {}",
                    request.method.to_ascii_uppercase(),
                    request.path
                ),
            ),
        }
    }

    fn name(&self) -> &str {
        "Light Reject"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_with_schema(schema: SchemaTable) -> LightRejectStage {
        LightRejectStage::new(&LimitsConfig::default(), Arc::new(schema))
    }

    fn evaluate(stage: &LightRejectStage, request: &RequestRecord) -> StageResult {
        stage.evaluate(request, &mut StageContext::new(0.0))
    }

    #[test]
    fn test_oversized_body() {
        let stage = stage_with_schema(SchemaTable::new());
        let at_limit = RequestRecord::new("1.1.1.1", "post", "/upload").with_body_length(65536);
        let over = RequestRecord::new("1.1.1.1", "post", "/upload").with_body_length(65537);

        assert_eq!(evaluate(&stage, &at_limit), StageResult::Pass);
        assert!(evaluate(&stage, &over).is_block());
    }

    #[test]
    fn test_suspicious_paths() {
        let stage = stage_with_schema(SchemaTable::new());
        for path in ["/wp-login.php", "/app/.env", "/.git/config", "/PHPMyAdmin/index.php"] {
            let request = RequestRecord::new("1.1.1.1", "get", path);
            assert!(evaluate(&stage, &request).is_block(), "{} should be rejected", path);
        }
        let request = RequestRecord::new("1.1.1.1", "get", "/wordpress-tips");
        assert_eq!(evaluate(&stage, &request), StageResult::Pass);
    }

    #[test]
    fn test_schema_without_table_is_skipped() {
        let stage = stage_with_schema(SchemaTable::new());
        let request = RequestRecord::new("1.1.1.1", "delete", "/not/in/any/schema");
        assert_eq!(evaluate(&stage, &request), StageResult::Pass);
    }

    #[test]
    fn test_schema_rejections() {
        let schema = SchemaTable::from_entries(&[(r"/api/data", &["get"][..])]).unwrap();
        let stage = stage_with_schema(schema);

        let allowed = RequestRecord::new("1.1.1.1", "GET", "/api/data");
        let wrong_method = RequestRecord::new("1.1.1.1", "DELETE", "/api/data");
        let unknown = RequestRecord::new("1.1.1.1", "GET", "/api/other");

        assert_eq!(evaluate(&stage, &allowed), StageResult::Pass);
        assert!(matches!(
            evaluate(&stage, &wrong_method),
            StageResult::Block { attribution: Attribution::LightReject, .. }
        ));
        assert!(evaluate(&stage, &unknown).is_block());
    }
}
