//! Chaining: producing the next generation of payloads from a completed one.
//!
//! `next_payloads` is a pure function of the completed payload, safe to call
//! repeatedly: it drops the consumed first step, fans out when the new first
//! entry is a group, clears the identity (forcing re-derivation), and applies
//! each branch's chain filter to the carried-forward records.

use serde::{Deserialize, Serialize};

use crate::payload::{Payload, ProcessStep, Record, StepEntry};

/// Comparison operator for a numeric property bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Equal.
    Eq,
}

impl CompareOp {
    fn evaluate(self, left: f64, right: f64) -> bool {
        match self {
            Self::Lt => left < right,
            Self::Lte => left <= right,
            Self::Gt => left > right,
            Self::Gte => left >= right,
            Self::Eq => (left - right).abs() < f64::EPSILON,
        }
    }
}

/// A numeric bound on a record property.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyBound {
    /// Property key to compare.
    pub key: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Right-hand value of the comparison.
    pub value: f64,
}

/// Predicate selecting which records of a completed payload carry forward
/// to the next process step.
///
/// A record matches when it satisfies every declared clause; a filter with
/// no clauses matches everything. A record missing the bounded property
/// does not match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainFilter {
    /// Wildcard pattern (`*` matches any run of characters) over record IDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_pattern: Option<String>,
    /// Numeric bound over a record property.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<PropertyBound>,
}

impl ChainFilter {
    /// Creates a filter matching record IDs against a wildcard pattern.
    #[must_use]
    pub fn id_pattern(pattern: impl Into<String>) -> Self {
        Self {
            id_pattern: Some(pattern.into()),
            property: None,
        }
    }

    /// Adds a numeric property bound to the filter.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, op: CompareOp, value: f64) -> Self {
        self.property = Some(PropertyBound {
            key: key.into(),
            op,
            value,
        });
        self
    }

    /// Returns true if the record satisfies every clause of the filter.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(pattern) = &self.id_pattern {
            if !wildcard_match(pattern, &record.id) {
                return false;
            }
        }
        if let Some(bound) = &self.property {
            let Some(value) = record.numeric_property(&bound.key) else {
                return false;
            };
            if !bound.op.evaluate(value, bound.value) {
                return false;
            }
        }
        true
    }
}

/// Matches `text` against a pattern where `*` matches any run of characters.
///
/// Iterative backtracking over a single star position; linear in practice
/// for the short identifiers this is applied to.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

impl Payload {
    /// Produces the next generation of payloads after this one completes.
    ///
    /// Drops the consumed first step. If the new first entry is a fan-out
    /// group, yields one chained payload per branch. Each chained payload
    /// has its identity cleared (forcing re-derivation) and its records
    /// restricted by the branch's chain filter, when one is declared.
    ///
    /// Pure and repeatable; yields nothing when no steps remain.
    pub fn next_payloads(&self) -> impl Iterator<Item = Payload> + '_ {
        let remaining = self.process.get(1..).unwrap_or(&[]);
        let (branches, tail): (Vec<ProcessStep>, &[StepEntry]) = match remaining.split_first() {
            None => (Vec::new(), &[]),
            Some((StepEntry::Single(step), tail)) => (vec![step.clone()], tail),
            Some((StepEntry::Fanout(steps), tail)) => (steps.clone(), tail),
        };

        branches.into_iter().map(move |branch| {
            let records: Vec<Record> = match &branch.chain_filter {
                Some(filter) => self
                    .records
                    .iter()
                    .filter(|record| filter.matches(record))
                    .cloned()
                    .collect(),
                None => self.records.clone(),
            };

            let mut process = Vec::with_capacity(tail.len() + 1);
            process.push(StepEntry::Single(branch));
            process.extend(tail.iter().cloned());

            Payload::new(process, records)
        })
    }
}
