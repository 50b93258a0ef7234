use pingora_anomaly::{
    AnomalyClassifier, ClassifierError, DecisionEngine, DerivedFeatures, EngineConfig,
    RequestRecord,
};
use std::sync::Arc;

/// Flags any IP that keeps hitting the same path.
struct RepeatedPathClassifier {
    limit: usize,
}

impl AnomalyClassifier for RepeatedPathClassifier {
    fn classify(
        &self,
        _request: &RequestRecord,
        features: &DerivedFeatures,
    ) -> Result<bool, ClassifierError> {
        Ok(features.path_hits > self.limit)
    }
}

fn browser(ip: &str, path: &str, timestamp: f64) -> RequestRecord {
    RequestRecord::new(ip, "GET", path)
        .with_header("user-agent", "Mozilla/5.0")
        .with_header("accept", "*/*")
        .with_header("sec-fetch-site", "same-site")
        .with_header("sec-ch-ua", "x")
        .with_timestamp(timestamp)
}

fn main() {
    env_logger::init();

    let engine = match DecisionEngine::builder(EngineConfig::default())
        .classifier(Arc::new(RepeatedPathClassifier { limit: 10 }))
        .build()
    {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    println!("Stages: {}\n", engine.stage_names().join(" -> "));

    // Test 1: Normal request
    println!("1. Normal request:");
    println!("Decision: {:?}\n", engine.evaluate(&browser("198.51.100.1", "/api/users", 0.0)));

    // Test 2: Scripted client
    println!("2. curl User-Agent:");
    let curl = RequestRecord::new("198.51.100.2", "GET", "/api/users")
        .with_header("user-agent", "curl/8.4.0")
        .with_timestamp(0.0);
    println!("Decision: {:?}\n", engine.evaluate(&curl));

    // Test 3: GraphQL introspection
    println!("3. GraphQL introspection:");
    let introspection = browser("198.51.100.3", "/graphql", 0.0)
        .with_graphql_query("{ __schema { types { name } } }");
    println!("Decision: {:?}\n", engine.evaluate(&introspection));

    // Test 4: Probing a well-known path
    println!("4. Suspicious path:");
    println!("Decision: {:?}\n", engine.evaluate(&browser("198.51.100.4", "/.env", 0.0)));

    // Test 5: Same path over and over, escalated by the classifier
    println!("5. Repeated path (sending 12 requests):");
    for i in 1..=12 {
        let decision = engine.evaluate(&browser("198.51.100.5", "/checkout", i as f64));
        if decision.anomalous {
            println!("Request {} - flagged as {}", i, decision.attribution);
            break;
        }
    }

    // Test 6: Rate limiting
    println!("\n6. Rate limiting test (sending 105 requests):");
    for i in 1..=105 {
        let path = format!("/api/items/{}", i);
        let decision = engine.evaluate(&browser("198.51.100.6", &path, i as f64 * 0.1));
        if decision.anomalous {
            println!("Request {} - {}", i, decision.reason.unwrap_or_default());
            break;
        }
        if i % 25 == 0 {
            println!("Sent {} requests...", i);
        }
    }

    match serde_json::to_string_pretty(&engine.evaluate(&curl)) {
        Ok(json) => println!("\nWire form of a block:\n{}", json),
        Err(e) => eprintln!("Failed to serialize decision: {}", e),
    }
}
