use crate::config::{ConfigError, SchemaRuleConfig};
use regex::Regex;
use std::collections::HashSet;

/// Result of checking a path/method pair against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaVerdict {
    /// No table loaded; the check abstains.
    Skipped,
    Allowed,
    UnknownPath,
    MethodNotAllowed,
}

#[derive(Debug, Clone)]
pub struct SchemaRule {
    pattern: Regex,
    methods: HashSet<String>,
}

impl SchemaRule {
    /// Patterns are regular expressions matched against the whole path.
    pub fn new(pattern: &str, methods: &[&str]) -> Result<Self, regex::Error> {
        let anchored = format!("^(?:{})$", pattern.trim_start_matches('^').trim_end_matches('$'));
        Ok(Self {
            pattern: Regex::new(&anchored)?,
            methods: methods.iter().map(|m| m.trim().to_ascii_lowercase()).collect(),
        })
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    pub fn allows(&self, method: &str) -> bool {
        self.methods.contains(&method.to_ascii_lowercase())
    }
}

/// Ordered path/method whitelist. Loaded once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SchemaTable {
    rules: Vec<SchemaRule>,
}

impl SchemaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[(&str, &[&str])]) -> Result<Self, regex::Error> {
        let rules = entries
            .iter()
            .map(|(pattern, methods)| SchemaRule::new(pattern, methods))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn from_config(rules: &[SchemaRuleConfig]) -> Result<Self, ConfigError> {
        let mut table = Self::new();
        for rule in rules {
            let methods: Vec<&str> = rule.methods.iter().map(String::as_str).collect();
            let compiled =
                SchemaRule::new(&rule.path, &methods).map_err(|source| ConfigError::SchemaPattern {
                    pattern: rule.path.clone(),
                    source,
                })?;
            table.rules.push(compiled);
        }
        Ok(table)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// First matching rule decides.
    pub fn check(&self, path: &str, method: &str) -> SchemaVerdict {
        if self.rules.is_empty() {
            return SchemaVerdict::Skipped;
        }

        let path = path.split('?').next().unwrap_or(path);
        match self.rules.iter().find(|rule| rule.matches_path(path)) {
            None => SchemaVerdict::UnknownPath,
            Some(rule) if rule.allows(method) => SchemaVerdict::Allowed,
            Some(_) => SchemaVerdict::MethodNotAllowed,
        }
    }
}
