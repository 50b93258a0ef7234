use std::time::{SystemTime, UNIX_EPOCH};

/// Header bag with case-insensitive keys.
///
/// Keys are lowercased once at insertion and every lookup lowercases its
/// argument, so stages never have to care about header casing. Insertion
/// order is preserved; inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let key = name.trim().to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key, value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let key = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Present and not blank.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).map_or(false, |v| !v.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = HeaderMap::new();
        for (k, v) in iter {
            headers.insert(k.as_ref(), v.as_ref());
        }
        headers
    }
}

/// Normalized snapshot of one inbound request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestRecord {
    pub ip: String,
    pub headers: HeaderMap,
    pub path: String,
    pub method: String,
    pub body_length: u64,
    /// Seconds since the epoch. Wall clock is used when absent.
    pub timestamp: Option<f64>,
    pub same_site: bool,
    pub graphql_query: Option<String>,
}

impl RequestRecord {
    pub fn new(ip: &str, method: &str, path: &str) -> Self {
        Self {
            ip: ip.trim().to_string(),
            method: method.trim().to_ascii_lowercase(),
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body_length(mut self, body_length: u64) -> Self {
        self.body_length = body_length;
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_same_site(mut self, same_site: bool) -> Self {
        self.same_site = same_site;
        self
    }

    pub fn with_graphql_query(mut self, query: &str) -> Self {
        self.graphql_query = Some(query.to_string());
        self
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("user-agent")
    }

    /// Evaluation time for this record. A non-finite timestamp would freeze
    /// the IP's window, so it falls back to the wall clock too.
    pub fn now(&self) -> f64 {
        self.timestamp
            .filter(|t| t.is_finite())
            .unwrap_or_else(wall_clock_secs)
    }
}

pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", "Mozilla/5.0");
        assert_eq!(headers.get("user-agent"), Some("Mozilla/5.0"));
        assert_eq!(headers.get("USER-AGENT"), Some("Mozilla/5.0"));
    }

    #[test]
    fn test_repeated_header_replaces_in_place() {
        let headers: HeaderMap = vec![("Accept", "a"), ("Host", "h"), ("ACCEPT", "b")]
            .into_iter()
            .collect();
        assert_eq!(headers.len(), 2);
        let keys: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["accept", "host"]);
        assert_eq!(headers.get("accept"), Some("b"));
    }

    #[test]
    fn test_blank_header_is_not_present() {
        let headers: HeaderMap = vec![("cookie", "  ")].into_iter().collect();
        assert!(!headers.has("cookie"));
        assert!(headers.get("cookie").is_some());
    }

    #[test]
    fn test_record_normalizes_method() {
        let record = RequestRecord::new(" 1.1.1.1 ", "GET", "/api");
        assert_eq!(record.method, "get");
        assert_eq!(record.ip, "1.1.1.1");
    }

    #[test]
    fn test_explicit_timestamp_wins() {
        let record = RequestRecord::new("1.1.1.1", "get", "/").with_timestamp(42.0);
        assert_eq!(record.now(), 42.0);
    }

    #[test]
    fn test_non_finite_timestamp_uses_wall_clock() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let now = RequestRecord::new("1.1.1.1", "get", "/").with_timestamp(bad).now();
            assert!(now.is_finite());
            assert!(now > 0.0);
        }
    }
}
