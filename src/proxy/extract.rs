use crate::detection::{HeaderMap, RequestRecord};
use pingora::http::RequestHeader;
use std::net::IpAddr;

/// Client IP: the first X-Forwarded-For entry when `trust_forwarded_for` is
/// set, otherwise the peer address. Empty when neither is known.
pub fn client_ip(
    header: &RequestHeader,
    peer: Option<IpAddr>,
    trust_forwarded_for: bool,
) -> String {
    if !trust_forwarded_for {
        return peer.map(|ip| ip.to_string()).unwrap_or_default();
    }

    let forwarded = header
        .headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match forwarded {
        Some(ip) => ip.to_string(),
        None => peer.map(|ip| ip.to_string()).unwrap_or_default(),
    }
}

fn content_length(header: &RequestHeader) -> Option<u64> {
    header
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Fetch metadata says the request came from our own site.
pub fn is_same_site(headers: &HeaderMap) -> bool {
    headers.get("sec-fetch-site").map_or(false, |v| {
        let v = v.trim();
        v.eq_ignore_ascii_case("same-site") || v.eq_ignore_ascii_case("same-origin")
    })
}

/// `query` parameter of a GraphQL GET request.
pub fn graphql_from_query_string(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != "query" {
            return None;
        }
        let value = value.replace('+', " ");
        Some(match urlencoding::decode(&value) {
            Ok(decoded) => decoded.into_owned(),
            // undecodable payloads still get parsed, and rejected there
            Err(_) => value,
        })
    })
}

/// GraphQL document of a POST body: raw for `application/graphql`,
/// otherwise the `query` field of a JSON request or batch.
pub fn graphql_from_body(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let is_raw = content_type.map_or(false, |ct| {
        ct.trim().to_ascii_lowercase().starts_with("application/graphql")
    });
    if is_raw {
        return Some(String::from_utf8_lossy(body).into_owned());
    }

    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let queries: Vec<&str> = match &value {
        serde_json::Value::Array(batch) => batch
            .iter()
            .filter_map(|op| op.get("query").and_then(|q| q.as_str()))
            .collect(),
        op => op.get("query").and_then(|q| q.as_str()).into_iter().collect(),
    };

    if queries.is_empty() {
        None
    } else {
        Some(queries.join("\n"))
    }
}

fn is_chunked(header: &RequestHeader) -> bool {
    header
        .headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"))
}

/// Whether evaluation has to wait for the body: a GraphQL POST that carries
/// one, by length or chunked.
pub fn needs_body(header: &RequestHeader, graphql_path: &str) -> bool {
    if header.method != http::Method::POST || header.uri.path() != graphql_path {
        return false;
    }
    match content_length(header) {
        Some(len) => len > 0,
        None => is_chunked(header),
    }
}

/// Normalize a request header into a [`RequestRecord`].
pub fn build_record(header: &RequestHeader, client_ip: &str, graphql_path: &str) -> RequestRecord {
    let headers: HeaderMap = header
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let mut record = RequestRecord::new(client_ip, header.method.as_str(), header.uri.path())
        .with_body_length(content_length(header).unwrap_or(0))
        .with_same_site(is_same_site(&headers))
        .with_headers(headers);

    if header.method == http::Method::GET && header.uri.path() == graphql_path {
        record.graphql_query = header.uri.query().and_then(graphql_from_query_string);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn header(method: &str, uri: &str, headers: &[(&str, &str)]) -> RequestHeader {
        let mut req = RequestHeader::build(method, uri.as_bytes(), None).unwrap();
        for (name, value) in headers {
            req.insert_header(name.to_string(), value.to_string()).unwrap();
        }
        req
    }

    #[test]
    fn test_client_ip_prefers_trusted_forwarded_for() {
        let req = header("GET", "/", &[("X-Forwarded-For", " 9.9.9.9 , 10.0.0.1")]);
        let peer = Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(client_ip(&req, peer, true), "9.9.9.9");
    }

    #[test]
    fn test_untrusted_forwarded_for_is_ignored() {
        let req = header("GET", "/", &[("X-Forwarded-For", "9.9.9.9")]);
        let peer = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(client_ip(&req, peer, false), "203.0.113.7");
        assert_eq!(client_ip(&req, None, false), "");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let req = header("GET", "/", &[]);
        let peer = Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(client_ip(&req, peer, true), "127.0.0.1");
        assert_eq!(client_ip(&req, None, true), "");
    }

    #[test]
    fn test_graphql_from_query_string() {
        assert_eq!(
            graphql_from_query_string("op=x&query=%7B+user+%7B+id+%7D+%7D").as_deref(),
            Some("{ user { id } }")
        );
        assert_eq!(graphql_from_query_string("op=x"), None);
    }

    #[test]
    fn test_graphql_from_json_body() {
        let body = br#"{"query":"{ user { id } }","variables":{}}"#;
        assert_eq!(
            graphql_from_body(Some("application/json"), body).as_deref(),
            Some("{ user { id } }")
        );

        let batch = br#"[{"query":"{ a }"},{"query":"{ b }"}]"#;
        assert_eq!(graphql_from_body(None, batch).as_deref(), Some("{ a }\n{ b }"));

        assert_eq!(graphql_from_body(None, b"not json"), None);
        assert_eq!(graphql_from_body(None, b""), None);
    }

    #[test]
    fn test_graphql_from_raw_body() {
        assert_eq!(
            graphql_from_body(Some("application/graphql; charset=utf-8"), b"{ a }").as_deref(),
            Some("{ a }")
        );
    }

    #[test]
    fn test_needs_body() {
        assert!(needs_body(&header("POST", "/graphql", &[("Content-Length", "20")]), "/graphql"));
        assert!(needs_body(&header("POST", "/graphql", &[("Transfer-Encoding", "chunked")]), "/graphql"));
        assert!(!needs_body(&header("POST", "/graphql", &[]), "/graphql"));
        assert!(!needs_body(&header("POST", "/graphql", &[("Content-Length", "0")]), "/graphql"));
        assert!(!needs_body(&header("POST", "/api", &[("Content-Length", "20")]), "/graphql"));
        assert!(!needs_body(&header("GET", "/graphql", &[]), "/graphql"));
    }

    #[test]
    fn test_build_record() {
        let req = header(
            "GET",
            "/graphql?query=%7B%20__schema%20%7B%20types%20%7B%20name%20%7D%20%7D%20%7D",
            &[
                ("User-Agent", "Mozilla/5.0"),
                ("Sec-Fetch-Site", "same-origin"),
                ("Content-Length", "0"),
            ],
        );
        let record = build_record(&req, "1.2.3.4", "/graphql");
        assert_eq!(record.ip, "1.2.3.4");
        assert_eq!(record.method, "get");
        assert_eq!(record.path, "/graphql");
        assert_eq!(record.user_agent(), Some("Mozilla/5.0"));
        assert!(record.same_site);
        assert_eq!(record.body_length, 0);
        assert_eq!(
            record.graphql_query.as_deref(),
            Some("{ __schema { types { name } } }")
        );
    }

    #[test]
    fn test_build_record_outside_graphql_path() {
        let req = header("GET", "/api/data?query=%7Ba%7D", &[("Sec-Fetch-Site", "cross-site")]);
        let record = build_record(&req, "1.2.3.4", "/graphql");
        assert!(record.graphql_query.is_none());
        assert!(!record.same_site);
    }
}
