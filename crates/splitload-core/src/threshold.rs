//! Threshold rules
//!
//! Rules use the k6 notation: a selector `metric` or `metric{tag:value,...}`
//! and a predicate `aggregation op value`, e.g. `p(95)<300`, `rate>0.95`,
//! `count<50`. Rules are evaluated once against the final registry.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{LoadError, Result};
use crate::metrics::{Aggregate, MetricKind, MetricsRegistry, Tags};

/// Statistic a predicate compares
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in 0..=100
    Percentile(f64),
}

impl Aggregation {
    /// Compute the statistic, `None` when it does not apply to the kind
    pub fn apply(&self, aggregate: &Aggregate) -> Option<f64> {
        match (self, aggregate) {
            (Self::Count, Aggregate::Counter(count)) => Some(*count as f64),
            (Self::Rate, Aggregate::Rate { hits, total }) => {
                Some(if *total == 0 {
                    0.0
                } else {
                    *hits as f64 / *total as f64
                })
            }
            (Self::Avg, Aggregate::Trend(t)) => Some(t.avg()),
            (Self::Min, Aggregate::Trend(t)) => Some(t.min()),
            (Self::Max, Aggregate::Trend(t)) => Some(t.max()),
            (Self::Med, Aggregate::Trend(t)) => Some(t.med()),
            (Self::Percentile(p), Aggregate::Trend(t)) => Some(t.percentile(*p)),
            _ => None,
        }
    }

    /// Metric kind this aggregation applies to
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Count => MetricKind::Counter,
            Self::Rate => MetricKind::Rate,
            _ => MetricKind::Trend,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "count"),
            Self::Rate => write!(f, "rate"),
            Self::Avg => write!(f, "avg"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Med => write!(f, "med"),
            Self::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    pub fn holds(&self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Lt => actual < expected,
            Self::Le => actual <= expected,
            Self::Gt => actual > expected,
            Self::Ge => actual >= expected,
            Self::Eq => actual == expected,
            Self::Ne => actual != expected,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// `aggregation op value`
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub value: f64,
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparator.symbol(), self.value)
    }
}

impl FromStr for Predicate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();

        // Longest operators first so `<=` isn't read as `<`
        let (idx, comparator, len) = ["<=", ">=", "==", "!=", "<", ">"]
            .iter()
            .filter_map(|op| s.find(op).map(|idx| (idx, *op)))
            .min_by_key(|(idx, op)| (*idx, std::cmp::Reverse(op.len())))
            .map(|(idx, op)| {
                let comparator = match op {
                    "<=" => Comparator::Le,
                    ">=" => Comparator::Ge,
                    "==" => Comparator::Eq,
                    "!=" => Comparator::Ne,
                    "<" => Comparator::Lt,
                    _ => Comparator::Gt,
                };
                (idx, comparator, op.len())
            })
            .ok_or_else(|| "missing comparison operator".to_string())?;

        let (lhs, rhs) = (&s[..idx], &s[idx + len..]);
        let value: f64 = rhs
            .parse()
            .map_err(|_| format!("`{}` is not a number", rhs))?;

        let aggregation = match lhs {
            "count" => Aggregation::Count,
            "rate" => Aggregation::Rate,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            other => {
                let p = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation `{}`", other))?;
                let p: f64 = p
                    .parse()
                    .map_err(|_| format!("bad percentile `{}`", p))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {} out of range", p));
                }
                Aggregation::Percentile(p)
            }
        };

        Ok(Self {
            aggregation,
            comparator,
            value,
        })
    }
}

/// Split `metric{k:v,...}` into name and tag filter
pub fn parse_selector(selector: &str) -> std::result::Result<(String, Tags), String> {
    let selector = selector.trim();
    let Some(open) = selector.find('{') else {
        if selector.is_empty() {
            return Err("empty metric name".into());
        }
        return Ok((selector.to_string(), Tags::new()));
    };
    let name = selector[..open].trim();
    let body = selector[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| "unterminated tag filter".to_string())?;
    if name.is_empty() {
        return Err("empty metric name".into());
    }

    let mut tags = Tags::new();
    for pair in body.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| format!("tag `{}` is not key:value", pair.trim()))?;
        tags.insert(key.trim(), value.trim());
    }
    Ok((name.to_string(), tags))
}

/// One rule: selector plus predicate
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub metric: String,
    pub filter: Tags,
    pub predicate: Predicate,
}

impl ThresholdRule {
    pub fn parse(selector: &str, expression: &str) -> Result<Self> {
        let invalid = |reason: String| LoadError::InvalidThreshold {
            metric: selector.to_string(),
            expression: expression.to_string(),
            reason,
        };
        let (metric, filter) = parse_selector(selector).map_err(invalid)?;
        let predicate = expression.parse::<Predicate>().map_err(invalid)?;
        Ok(Self {
            metric,
            filter,
            predicate,
        })
    }

    /// `metric{tags}` as written in reports
    pub fn selector(&self) -> String {
        if self.filter.is_empty() {
            self.metric.clone()
        } else {
            format!("{}{}", self.metric, self.filter)
        }
    }

    pub fn evaluate(&self, metrics: &MetricsRegistry) -> ThresholdResult {
        let (status, actual) = match metrics.query(&self.metric, &self.filter) {
            None => (ThresholdStatus::NoData, None),
            Some(aggregate) if aggregate.observations() == 0 => (ThresholdStatus::NoData, None),
            Some(aggregate) => match self.predicate.aggregation.apply(&aggregate) {
                None => (ThresholdStatus::Incompatible, None),
                Some(actual) => {
                    let status = if self.predicate.comparator.holds(actual, self.predicate.value) {
                        ThresholdStatus::Pass
                    } else {
                        ThresholdStatus::Fail
                    };
                    (status, Some(actual))
                }
            },
        };
        ThresholdResult {
            selector: self.selector(),
            expression: self.predicate.to_string(),
            status,
            actual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    Pass,
    Fail,
    /// No matching samples; reported, does not fail the run
    NoData,
    /// Aggregation does not apply to the metric kind; counts as a violation
    Incompatible,
}

impl ThresholdStatus {
    pub fn is_violation(self) -> bool {
        matches!(self, Self::Fail | Self::Incompatible)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub selector: String,
    pub expression: String,
    pub status: ThresholdStatus,
    /// Computed statistic, absent for NoData and Incompatible
    pub actual: Option<f64>,
}

/// Outcome of all rules
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Verdict {
    pub results: Vec<ThresholdResult>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        !self.results.iter().any(|r| r.status.is_violation())
    }

    pub fn violations(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| r.status.is_violation())
    }
}

/// Evaluate every rule; violations are all reported, not just the first
pub fn evaluate(rules: &[ThresholdRule], metrics: &MetricsRegistry) -> Verdict {
    Verdict {
        results: rules.iter().map(|rule| rule.evaluate(metrics)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_predicates() {
        let p: Predicate = "p(95)<300".parse().unwrap();
        assert_eq!(p.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(p.comparator, Comparator::Lt);
        assert_eq!(p.value, 300.0);

        let p: Predicate = "rate >= 0.95".parse().unwrap();
        assert_eq!((p.aggregation, p.comparator), (Aggregation::Rate, Comparator::Ge));

        let p: Predicate = "p(99.9)<=1500".parse().unwrap();
        assert_eq!(p.aggregation, Aggregation::Percentile(99.9));
        assert_eq!(p.comparator, Comparator::Le);
        assert_eq!(p.to_string(), "p(99.9)<=1500");

        for bad in ["p95<300", "rate", "avg<fast", "p(120)<1", "median<3"] {
            assert!(bad.parse::<Predicate>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_parse_selector() {
        let (name, tags) = parse_selector("read_latency_ms{group:stress, phase:burst}").unwrap();
        assert_eq!(name, "read_latency_ms");
        assert_eq!(tags.get("group"), Some("stress"));
        assert_eq!(tags.get("phase"), Some("burst"));

        assert!(parse_selector("metric{group:stress").is_err());
        assert!(parse_selector("metric{group}").is_err());
        assert!(parse_selector("{a:b}").is_err());
    }

    #[test]
    fn test_invalid_rule_error() {
        let err = ThresholdRule::parse("x", "p(95)~3").unwrap_err();
        assert!(matches!(err, LoadError::InvalidThreshold { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_p95_nearest_rank_fails() {
        let metrics = MetricsRegistry::new();
        let tags = Tags::new();
        for v in [100.0, 120.0, 150.0, 290.0, 310.0, 140.0] {
            metrics.trend("write_latency_ms", v, &tags);
        }
        let rule = ThresholdRule::parse("write_latency_ms", "p(95)<300").unwrap();
        let result = rule.evaluate(&metrics);
        assert_eq!(result.status, ThresholdStatus::Fail);
        assert!((result.actual.unwrap() - 310.0).abs() < 0.5);
    }

    #[test]
    fn test_statuses_and_verdict() {
        let metrics = MetricsRegistry::new();
        let stress = Tags::new().with("group", "stress");
        let warmup = Tags::new().with("group", "warmup");
        for _ in 0..99 {
            metrics.rate("success_rate", true, &stress);
        }
        metrics.rate("success_rate", false, &stress);
        metrics.rate("success_rate", false, &warmup);
        metrics.add("duplicate_not_rejected", 3, &stress);

        let rules = vec![
            ThresholdRule::parse("success_rate{group:stress}", "rate>0.95").unwrap(),
            ThresholdRule::parse("success_rate{group:warmup}", "rate>0.95").unwrap(),
            ThresholdRule::parse("duplicate_not_rejected", "count<1").unwrap(),
            ThresholdRule::parse("duplicate_not_rejected", "p(95)<1").unwrap(),
            ThresholdRule::parse("replication_lag_rate", "rate<0.1").unwrap(),
        ];
        let verdict = evaluate(&rules, &metrics);
        let statuses: Vec<_> = verdict.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ThresholdStatus::Pass,
                ThresholdStatus::Fail,
                ThresholdStatus::Fail,
                ThresholdStatus::Incompatible,
                ThresholdStatus::NoData,
            ]
        );
        assert!(!verdict.passed());
        assert_eq!(verdict.violations().count(), 3);
        assert_eq!(verdict.results[2].actual, Some(3.0));
        assert_eq!(verdict.results[1].selector, "success_rate{group:warmup}");
    }

    #[test]
    fn test_no_data_does_not_fail() {
        let metrics = MetricsRegistry::new();
        let rules = vec![ThresholdRule::parse("anything", "count<5").unwrap()];
        assert!(evaluate(&rules, &metrics).passed());
    }
}
