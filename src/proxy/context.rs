use super::BodyInspector;
use crate::detection::{Decision, RequestRecord};

pub struct ProxyContext {
    pub client_ip: String,
    /// Record waiting for its body before it can be evaluated.
    pub pending: Option<RequestRecord>,
    pub body_inspector: BodyInspector,
    pub decision: Option<Decision>,
}

impl ProxyContext {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            client_ip: String::new(),
            pending: None,
            body_inspector: BodyInspector::new(max_body_size),
            decision: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.decision.as_ref().map_or(false, |d| d.anomalous)
    }
}
