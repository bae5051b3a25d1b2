use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use prometheus::{GaugeVec, Opts, Registry};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::template::EmailTemplate;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("template {template}: invalid metrics rules: {source}")]
    Rules {
        template: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("metric {metric}: invalid pattern: {source}")]
    Pattern {
        metric: String,
        #[source]
        source: regex::Error,
    },

    #[error("metric {metric}: {source}")]
    Registry {
        metric: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("metric {metric}: '{value}' is not a number")]
    NotANumber { metric: String, value: String },
}

/// Turns one accepted message into signals.
pub trait MessageParser {
    /// Returns how many values were extracted.
    fn parse(
        &mut self,
        template: &EmailTemplate,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, ParseError>;
}

#[derive(Debug, Deserialize)]
struct MetricRule {
    name: String,
    pattern: String,
    #[serde(default)]
    help: Option<String>,
}

struct MetricGauges {
    value: GaugeVec,
    timestamp: GaugeVec,
}

/// Applies each template's `metrics` regexes to the body and sets one gauge per rule,
/// labelled by sender.
pub struct RegexGaugeParser {
    registry: Registry,
    gauges: HashMap<String, MetricGauges>,
    patterns: HashMap<String, Regex>,
}

impl RegexGaugeParser {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            gauges: HashMap::new(),
            patterns: HashMap::new(),
        }
    }

    fn gauges(&mut self, rule: &MetricRule) -> Result<&MetricGauges, ParseError> {
        if !self.gauges.contains_key(&rule.name) {
            let registry_err = |source| ParseError::Registry {
                metric: rule.name.clone(),
                source,
            };
            let help = rule
                .help
                .clone()
                .unwrap_or_else(|| format!("Value extracted for {}", rule.name));
            let value = GaugeVec::new(Opts::new(rule.name.as_str(), help), &["sender"])
                .map_err(registry_err)?;
            let timestamp = GaugeVec::new(
                Opts::new(
                    format!("{}_timestamp_seconds", rule.name),
                    format!("Time of the message {} was last read from", rule.name),
                ),
                &["sender"],
            )
            .map_err(registry_err)?;
            self.registry
                .register(Box::new(value.clone()))
                .map_err(registry_err)?;
            self.registry
                .register(Box::new(timestamp.clone()))
                .map_err(registry_err)?;
            self.gauges
                .insert(rule.name.clone(), MetricGauges { value, timestamp });
        }
        Ok(&self.gauges[&rule.name])
    }

    fn pattern(&mut self, rule: &MetricRule) -> Result<&Regex, ParseError> {
        if !self.patterns.contains_key(&rule.pattern) {
            let re = Regex::new(&rule.pattern).map_err(|source| ParseError::Pattern {
                metric: rule.name.clone(),
                source,
            })?;
            self.patterns.insert(rule.pattern.clone(), re);
        }
        Ok(&self.patterns[&rule.pattern])
    }
}

impl MessageParser for RegexGaugeParser {
    fn parse(
        &mut self,
        template: &EmailTemplate,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, ParseError> {
        let Some(rules) = template.rules.get("metrics") else {
            debug!("Template {} has no metrics rules", template.index);
            return Ok(0);
        };
        let rules: Vec<MetricRule> =
            serde_json::from_value(rules.clone()).map_err(|source| ParseError::Rules {
                template: template.index,
                source,
            })?;

        // Every rule runs even when an earlier one fails.
        let mut extracted = 0;
        let mut first_error = None;
        for rule in &rules {
            match self.apply(template, rule, body, timestamp) {
                Ok(true) => extracted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Template {}: {e}", template.index);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(extracted),
        }
    }
}

impl RegexGaugeParser {
    /// Sets the rule's gauges; `false` when the pattern does not match.
    fn apply(
        &mut self,
        template: &EmailTemplate,
        rule: &MetricRule,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, ParseError> {
        let raw = {
            let re = self.pattern(rule)?;
            let Some(caps) = re.captures(body) else {
                debug!("Metric {} did not match", rule.name);
                return Ok(false);
            };
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        };
        let value: f64 = raw
            .trim()
            .replace(',', "")
            .parse()
            .map_err(|_| ParseError::NotANumber {
                metric: rule.name.clone(),
                value: raw.clone(),
            })?;

        let g = self.gauges(rule)?;
        g.value.with_label_values(&[template.sender.as_str()]).set(value);
        g.timestamp
            .with_label_values(&[template.sender.as_str()])
            .set(timestamp.timestamp_millis() as f64 / 1000.0);
        debug!("{}{{sender={}}} = {}", rule.name, template.sender, value);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::render;
    use serde_json::json;

    fn template(rules: serde_json::Value) -> EmailTemplate {
        EmailTemplate {
            index: 0,
            sender: "billing@example.com".into(),
            rules,
        }
    }

    #[test]
    fn matching_rule_sets_gauges() {
        let registry = Registry::new();
        let mut parser = RegexGaugeParser::new(registry.clone());
        let t = template(json!({
            "sender": "billing@example.com",
            "metrics": [
                { "name": "invoice_total", "pattern": "Total: \\$([0-9,.]+)", "help": "Invoice total" },
                { "name": "not_present", "pattern": "Missing: (\\d+)" }
            ]
        }));
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let n = parser.parse(&t, "Hello\nTotal: $1,234.50\nBye", at).unwrap();
        assert_eq!(n, 1);

        let text = render(&registry).unwrap();
        assert!(text.contains("invoice_total{sender=\"billing@example.com\"} 1234.5"));
        assert!(text.contains(
            "invoice_total_timestamp_seconds{sender=\"billing@example.com\"} 1700000000"
        ));
        assert!(!text.contains("not_present{"));
    }

    #[test]
    fn template_without_rules_extracts_nothing() {
        let mut parser = RegexGaugeParser::new(Registry::new());
        let n = parser
            .parse(&template(json!({ "sender": "x" })), "body", Utc::now())
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn non_numeric_capture_is_an_error() {
        let mut parser = RegexGaugeParser::new(Registry::new());
        let t = template(json!({ "metrics": [ { "name": "status", "pattern": "Status: (\\w+)" } ] }));
        let err = parser.parse(&t, "Status: green", Utc::now()).unwrap_err();
        assert!(matches!(err, ParseError::NotANumber { ref value, .. } if value == "green"));
    }

    #[test]
    fn failing_rule_does_not_block_later_rules() {
        let registry = Registry::new();
        let mut parser = RegexGaugeParser::new(registry.clone());
        let t = template(json!({ "metrics": [
            { "name": "status", "pattern": "Status: (\\w+)" },
            { "name": "broken", "pattern": "(" },
            { "name": "total", "pattern": "Total: (\\d+)" }
        ] }));

        let err = parser
            .parse(&t, "Status: green\nTotal: 42", Utc::now())
            .unwrap_err();

        assert!(matches!(err, ParseError::NotANumber { ref metric, .. } if metric == "status"));
        let text = render(&registry).unwrap();
        assert!(text.contains("total{sender=\"billing@example.com\"} 42"));
    }

    #[test]
    fn bad_regex_and_bad_name_are_errors() {
        let mut parser = RegexGaugeParser::new(Registry::new());
        let bad_re = template(json!({ "metrics": [ { "name": "x", "pattern": "(" } ] }));
        assert!(matches!(
            parser.parse(&bad_re, "", Utc::now()),
            Err(ParseError::Pattern { .. })
        ));

        let bad_name = template(json!({ "metrics": [ { "name": "has space", "pattern": "(1)" } ] }));
        assert!(matches!(
            parser.parse(&bad_name, "1", Utc::now()),
            Err(ParseError::Registry { .. })
        ));
    }

    #[test]
    fn same_metric_is_registered_once() {
        let registry = Registry::new();
        let mut parser = RegexGaugeParser::new(registry.clone());
        let t = template(json!({ "metrics": [ { "name": "balance", "pattern": "(\\d+)" } ] }));
        parser.parse(&t, "10", Utc::now()).unwrap();
        parser.parse(&t, "20", Utc::now()).unwrap();
        let text = render(&registry).unwrap();
        assert!(text.contains("balance{sender=\"billing@example.com\"} 20"));
    }
}
