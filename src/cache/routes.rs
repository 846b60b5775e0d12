//! Route whitelist and path classification.
//!
//! A request is cacheable only when its path contains one of the whitelisted
//! patterns. Rules are kept longest-pattern-first so a specific pattern is
//! never shadowed by a shorter one it contains; equal-length patterns keep
//! their declaration order.

use thiserror::Error;

/// Patterns and canonical resource names served by the back office.
const DEFAULT_RULES: &[(&str, &str)] = &[
    (
        "v1/bet_insights/partner-sports",
        "v1_bet_insights_partner_sports",
    ),
    (
        "v1/bet_insights/partner-widgets_settings",
        "v1_bet_insights_widgets_settings",
    ),
];

/// A single whitelist entry: any path containing `pattern` maps to `resource`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub pattern: String,
    pub resource: String,
}

impl RouteRule {
    pub fn new(pattern: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            resource: resource.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("path `{path}` does not match any whitelisted resource")]
    UnknownResource { path: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("route table must contain at least one rule")]
    Empty,
    #[error("route rule #{index} has an empty pattern")]
    EmptyPattern { index: usize },
    #[error("route rule #{index} has an empty resource name")]
    EmptyResource { index: usize },
}

/// Ordered whitelist used to classify request paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// Build a table from rules in declaration order.
    ///
    /// An empty pattern would match every path, so it is rejected along with
    /// empty resource names.
    pub fn new(rules: Vec<RouteRule>) -> Result<Self, RouteTableError> {
        if rules.is_empty() {
            return Err(RouteTableError::Empty);
        }

        for (index, rule) in rules.iter().enumerate() {
            if rule.pattern.is_empty() {
                return Err(RouteTableError::EmptyPattern { index });
            }
            if rule.resource.is_empty() {
                return Err(RouteTableError::EmptyResource { index });
            }
        }

        Ok(Self::ordered(rules))
    }

    fn ordered(mut rules: Vec<RouteRule>) -> Self {
        // Stable: equal lengths stay in declaration order.
        rules.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
        Self { rules }
    }

    /// Map a request path to its canonical resource name.
    pub fn classify(&self, path: &str) -> Result<&str, ClassifyError> {
        self.rules
            .iter()
            .find(|rule| path.contains(rule.pattern.as_str()))
            .map(|rule| rule.resource.as_str())
            .ok_or_else(|| ClassifyError::UnknownResource {
                path: path.to_string(),
            })
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .map(|(pattern, resource)| RouteRule::new(*pattern, *resource))
            .collect();
        Self::ordered(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_default_whitelist() {
        let table = RouteTable::default();
        assert_eq!(
            table.classify("/v1/bet_insights/partner-sports"),
            Ok("v1_bet_insights_partner_sports")
        );
        assert_eq!(
            table.classify("/v1/bet_insights/partner-widgets_settings"),
            Ok("v1_bet_insights_widgets_settings")
        );
    }

    #[test]
    fn containment_matches_anywhere_in_path() {
        let table = RouteTable::default();
        assert_eq!(
            table.classify("/api/v1/bet_insights/partner-sports/42?lang=en"),
            Ok("v1_bet_insights_partner_sports")
        );
    }

    #[test]
    fn unknown_path_is_rejected() {
        let table = RouteTable::default();
        let err = table.classify("/unknown/route").unwrap_err();
        assert_eq!(
            err,
            ClassifyError::UnknownResource {
                path: "/unknown/route".to_string()
            }
        );
    }

    #[test]
    fn longer_pattern_wins_regardless_of_declaration_order() {
        let table = RouteTable::new(vec![
            RouteRule::new("v1/sports", "sports"),
            RouteRule::new("v1/sports/live", "sports_live"),
        ])
        .expect("valid table");

        assert_eq!(table.classify("/v1/sports/live"), Ok("sports_live"));
        assert_eq!(table.classify("/v1/sports"), Ok("sports"));
    }

    #[test]
    fn equal_length_overlap_follows_declaration_order() {
        let table = RouteTable::new(vec![
            RouteRule::new("alpha", "first"),
            RouteRule::new("gamma", "second"),
        ])
        .expect("valid table");

        assert_eq!(table.classify("/alpha/gamma"), Ok("first"));
        assert_eq!(table.rules()[0].resource, "first");
    }

    #[test]
    fn rejects_empty_pattern() {
        let err = RouteTable::new(vec![
            RouteRule::new("v1/a", "a"),
            RouteRule::new("", "everything"),
        ])
        .unwrap_err();
        assert_eq!(err, RouteTableError::EmptyPattern { index: 1 });
    }

    #[test]
    fn rejects_empty_table() {
        assert_eq!(RouteTable::new(Vec::new()), Err(RouteTableError::Empty));
    }
}
