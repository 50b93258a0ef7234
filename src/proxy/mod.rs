pub mod body_inspector;
pub mod context;
pub mod extract;

pub use body_inspector::*;
pub use context::*;
pub use extract::*;

use crate::detection::{Attribution, Decision, DecisionEngine};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use log::{error, info, warn};
use pingora::prelude::*;
use pingora::upstreams::peer::HttpPeer;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;

/// HTTP status used to reject a request.
pub fn status_for(decision: &Decision) -> u16 {
    match decision.attribution {
        Attribution::IpRate => 429,
        _ => 403,
    }
}

/// Reverse proxy that runs every request through a [`DecisionEngine`]
/// before it reaches the upstream.
pub struct AnomalyProxy {
    pub engine: Arc<DecisionEngine>,
    pub metrics: Arc<MetricsCollector>,
    pub upstream_addr: (String, u16),
}

impl AnomalyProxy {
    pub fn new(
        upstream_addr: (String, u16),
        engine: Arc<DecisionEngine>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            engine,
            metrics,
            upstream_addr,
        }
    }

    fn graphql_path(&self) -> &str {
        &self.engine.config().graphql.path
    }

    fn record_decision(&self, decision: &Decision) {
        self.metrics.record_decision(decision);
        self.metrics.set_tracked_ips(self.engine.store().len());
    }
}

#[async_trait]
impl ProxyHttp for AnomalyProxy {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        ProxyContext::new(self.engine.config().limits.max_body_bytes as usize)
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let peer = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip());
        ctx.client_ip = client_ip(
            session.req_header(),
            peer,
            self.engine.config().proxy.trust_forwarded_for,
        );

        let record = build_record(session.req_header(), &ctx.client_ip, self.graphql_path());

        // GraphQL POSTs are evaluated once the body is in
        if needs_body(session.req_header(), self.graphql_path()) {
            ctx.pending = Some(record);
            return Ok(false);
        }

        let decision = self.engine.evaluate(&record);
        self.record_decision(&decision);

        if decision.anomalous {
            let _ = session.respond_error(status_for(&decision)).await;
            ctx.decision = Some(decision);
            return Ok(true);
        }

        ctx.decision = Some(decision);
        Ok(false)
    }

    async fn request_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<bytes::Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        if ctx.pending.is_none() {
            return Ok(());
        }

        // Hold every chunk back until the decision is made
        if let Some(chunk) = body.take() {
            if let Err(e) = ctx.body_inspector.append_chunk(&chunk) {
                warn!("Body size limit exceeded for {}: {}", ctx.client_ip, e);
                let decision = Decision::blocked(Attribution::LightReject, 0, e.to_string());
                self.record_decision(&decision);
                ctx.pending = None;
                ctx.decision = Some(decision);
                return Err(e);
            }
        }

        if !end_of_stream {
            return Ok(());
        }

        if let Some(mut record) = ctx.pending.take() {
            let content_type = session
                .req_header()
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            record.body_length = ctx.body_inspector.len() as u64;
            record.graphql_query = graphql_from_body(content_type, ctx.body_inspector.body());

            let decision = self.engine.evaluate(&record);
            self.record_decision(&decision);

            if decision.anomalous {
                let status = status_for(&decision);
                let reason = decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| decision.attribution.to_string());
                ctx.decision = Some(decision);
                return Err(Error::explain(ErrorType::HTTPStatus(status), reason));
            }
            ctx.decision = Some(decision);
        }

        *body = Some(ctx.body_inspector.take_body());
        Ok(())
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        if ctx.is_blocked() {
            error!("Refusing upstream connection for blocked request from {}", ctx.client_ip);
            return Err(pingora::Error::new_str("Request blocked by anomaly engine"));
        }

        let peer = Box::new(HttpPeer::new(
            (self.upstream_addr.0.as_str(), self.upstream_addr.1),
            false,
            "".to_string(),
        ));
        Ok(peer)
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        _upstream_request: &mut pingora::http::RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        if ctx.is_blocked() {
            return Err(pingora::Error::new_str(
                "Request blocked by anomaly engine before upstream",
            ));
        }

        Ok(())
    }

    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora::Error>,
        ctx: &mut Self::CTX,
    ) {
        let response_code = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        let method = session.req_header().method.as_str();
        let uri = session.req_header().uri.to_string();

        if let Some(error) = e {
            error!(
                "Request failed - IP: {}, Method: {}, URI: {}, Error: {:?}",
                ctx.client_ip, method, uri, error
            );
        } else {
            info!(
                "Request completed - IP: {}, Method: {}, URI: {}, Status: {}",
                ctx.client_ip, method, uri, response_code
            );
        }

        if let Some(decision) = ctx.decision.as_ref().filter(|d| d.anomalous) {
            warn!(
                "Anomalous request - IP: {}, Attribution: {}, Score: {}, Reason: {}",
                ctx.client_ip,
                decision.attribution,
                decision.score,
                decision.reason.as_deref().unwrap_or("")
            );
        }

        ctx.body_inspector.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_blocks_answer_429() {
        let decision = Decision::blocked(Attribution::IpRate, 0, "too many");
        assert_eq!(status_for(&decision), 429);
    }

    #[test]
    fn test_other_blocks_answer_403() {
        for attribution in Attribution::ALL {
            if attribution == Attribution::IpRate {
                continue;
            }
            assert_eq!(status_for(&Decision::blocked(attribution, 50, "x")), 403);
        }
    }
}
