// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Datapoint filters. A filter answers whether a datapoint must be dropped;
//! dropping is always silent.

use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::datapoint::Datapoint;

pub const POD_NAMESPACE_DIMENSION: &str = "kubernetes_pod_namespace";

pub trait DatapointFilter: Send + Sync {
    fn excludes(&self, dp: &Datapoint) -> bool;
}

/// Drops every datapoint whose metric is not whitelisted, unless the monitor
/// is configured to send all metrics.
#[derive(Debug, Clone)]
pub struct IncludedMetricsFilter {
    included: HashSet<String>,
}

impl IncludedMetricsFilter {
    /// Returns `None` when no filtering applies: `send_all_metrics` is set, or
    /// the whitelist is absent or empty.
    pub fn new(included: Option<&[String]>, send_all_metrics: bool) -> Option<Self> {
        match included {
            Some(metrics) if !send_all_metrics && !metrics.is_empty() => {
                Some(IncludedMetricsFilter {
                    included: metrics.iter().cloned().collect(),
                })
            }
            _ => None,
        }
    }
}

impl DatapointFilter for IncludedMetricsFilter {
    fn excludes(&self, dp: &Datapoint) -> bool {
        !self.included.contains(&dp.metric)
    }
}

/// Metric name and namespace exclusion as used by the Kubernetes monitors.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    excluded_metrics: HashSet<String>,
    excluded_namespaces: HashSet<String>,
}

impl ExclusionFilter {
    pub fn new(excluded_metrics: &[String], excluded_namespaces: &[String]) -> Self {
        ExclusionFilter {
            excluded_metrics: excluded_metrics.iter().cloned().collect(),
            excluded_namespaces: excluded_namespaces.iter().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.excluded_metrics.is_empty() && self.excluded_namespaces.is_empty()
    }
}

impl DatapointFilter for ExclusionFilter {
    fn excludes(&self, dp: &Datapoint) -> bool {
        if self.excluded_metrics.contains(&dp.metric) {
            return true;
        }
        dp.dimensions
            .get(POD_NAMESPACE_DIMENSION)
            .is_some_and(|ns| self.excluded_namespaces.contains(ns))
    }
}

/// Matches metric names against literals, `*` globs, or `/regex/` patterns.
/// A pattern starting with `!` negates it.
#[derive(Debug, Clone)]
pub struct MetricNameFilter {
    literals: HashSet<String>,
    patterns: Vec<Regex>,
    negated: Vec<MetricNameFilter>,
}

impl MetricNameFilter {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let mut filter = MetricNameFilter {
            literals: HashSet::new(),
            patterns: Vec::new(),
            negated: Vec::new(),
        };
        for pattern in patterns {
            if let Some(rest) = pattern.strip_prefix('!') {
                filter.negated.push(MetricNameFilter::new(&[rest.to_string()])?);
            } else if pattern.len() > 1 && pattern.starts_with('/') && pattern.ends_with('/') {
                filter
                    .patterns
                    .push(Regex::new(&pattern[1..pattern.len() - 1])?);
            } else if pattern.contains('*') || pattern.contains('?') {
                filter.patterns.push(Regex::new(&glob_to_regex(pattern))?);
            } else {
                filter.literals.insert(pattern.clone());
            }
        }
        Ok(filter)
    }

    fn matches_name(&self, name: &str) -> bool {
        let positive = self.literals.contains(name) || self.patterns.iter().any(|p| p.is_match(name));
        let has_positive = !self.literals.is_empty() || !self.patterns.is_empty();
        if self.negated.is_empty() {
            return positive;
        }
        let negated = self.negated.iter().any(|n| n.matches_name(name));
        // With only negations, everything not negated matches.
        if has_positive {
            positive && !negated
        } else {
            !negated
        }
    }
}

impl DatapointFilter for MetricNameFilter {
    fn excludes(&self, dp: &Datapoint) -> bool {
        self.matches_name(&dp.metric)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Drops a datapoint when any member filter excludes it.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn DatapointFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain::default()
    }

    pub fn with(mut self, filter: Arc<dyn DatapointFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push(&mut self, filter: Arc<dyn DatapointFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl DatapointFilter for FilterChain {
    fn excludes(&self, dp: &Datapoint) -> bool {
        self.filters.iter().any(|f| f.excludes(dp))
    }
}
