// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Node search query language.
//!
//! A query is one or more `field:value` terms joined by `AND`:
//!
//! ```text
//! role:db AND chef_environment:prod
//! network.lanip:10.0.*
//! *:*
//! ```
//!
//! - Dotted fields address nested attributes.
//! - `role`, `env` and `environment` are shorthands for `roles` and
//!   `chef_environment`.
//! - A field holding an array matches if any element matches.
//! - `*` in a value matches any run of characters.

use serde_json::Value;

use super::{DirectoryError, DirectoryResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    path: Vec<String>,
    pattern: String,
}

/// A parsed node search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    terms: Vec<Term>,
}

fn canonical_field(field: &str) -> &str {
    match field {
        "role" => "roles",
        "env" | "environment" => "chef_environment",
        other => other,
    }
}

impl Query {
    pub fn parse(query: &str) -> DirectoryResult<Self> {
        let mut terms = Vec::new();
        for raw in query.split(" AND ") {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(DirectoryError::InvalidQuery(query.to_string()));
            }
            if raw == "*:*" {
                continue;
            }
            let (field, value) = raw
                .split_once(':')
                .ok_or_else(|| DirectoryError::InvalidQuery(query.to_string()))?;
            let field = field.trim();
            let value = value.trim();
            if field.is_empty() || value.is_empty() {
                return Err(DirectoryError::InvalidQuery(query.to_string()));
            }
            terms.push(Term {
                path: canonical_field(field)
                    .split('.')
                    .map(str::to_string)
                    .collect(),
                pattern: value.to_string(),
            });
        }
        Ok(Self { terms })
    }

    /// Whether a node document satisfies every term.
    pub fn matches(&self, node: &Value) -> bool {
        self.terms.iter().all(|term| term.matches(node))
    }
}

impl Term {
    fn matches(&self, node: &Value) -> bool {
        let mut current = node;
        for segment in &self.path {
            match current.get(segment) {
                Some(next) => current = next,
                None => return false,
            }
        }
        value_matches(current, &self.pattern)
    }
}

fn value_matches(value: &Value, pattern: &str) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|item| value_matches(item, pattern)),
        Value::String(s) => glob_match(pattern, s),
        Value::Number(n) => glob_match(pattern, &n.to_string()),
        Value::Bool(b) => glob_match(pattern, if *b { "true" } else { "false" }),
        Value::Null | Value::Object(_) => false,
    }
}

/// Match `text` against a pattern where `*` matches any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !text.starts_with(first)
        || !text.ends_with(last)
        || text.len() < first.len() + last.len()
    {
        return false;
    }
    let Some(mut rest) = text.get(first.len()..text.len() - last.len()) else {
        return false;
    };
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(idx) => rest = &rest[idx + middle.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node() -> Value {
        json!({
            "name": "db1",
            "chef_environment": "prod",
            "roles": ["db", "base"],
            "ipaddress": "203.0.113.9",
            "network": { "lanip": "10.0.0.5" },
            "keymaster": { "uuid": "u1" }
        })
    }

    #[test]
    fn matches_role_and_environment() {
        let q = Query::parse("role:db AND env:prod").unwrap();
        assert!(q.matches(&node()));
        let q = Query::parse("roles:web AND chef_environment:prod").unwrap();
        assert!(!q.matches(&node()));
    }

    #[test]
    fn matches_nested_and_wildcards() {
        assert!(Query::parse("network.lanip:10.0.*").unwrap().matches(&node()));
        assert!(Query::parse("name:d*1").unwrap().matches(&node()));
        assert!(!Query::parse("network.lanip:192.*").unwrap().matches(&node()));
        assert!(Query::parse("*:*").unwrap().matches(&node()));
    }

    #[test]
    fn missing_field_does_not_match() {
        assert!(!Query::parse("keymaster.public_key:*").unwrap().matches(&node()));
    }

    #[test]
    fn rejects_malformed_queries() {
        assert!(Query::parse("").is_err());
        assert!(Query::parse("role").is_err());
        assert!(Query::parse("role:db AND ").is_err());
        assert!(Query::parse(":db").is_err());
    }

    #[test]
    fn glob_edge_cases() {
        assert!(glob_match("*", ""));
        assert!(glob_match("a*a", "aa"));
        assert!(!glob_match("a*a", "a"));
        assert!(glob_match("*b*", "abc"));
        assert!(!glob_match("abc", "abcd"));
    }

    #[test]
    fn wildcards_handle_multibyte_values() {
        let node = json!({ "name": "café" });
        assert!(!Query::parse("name:*b").unwrap().matches(&node));
        assert!(Query::parse("name:*é").unwrap().matches(&node));
        assert!(Query::parse("name:ca*").unwrap().matches(&node));
        assert!(!glob_match("c*xé", "café"));
    }
}
