//! Measurement value objects: frequencies, disaggregation axes, rating
//! scales, and the recorded-value shape shared by commands, events, and the
//! aggregate's history.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use pulse_core::{DomainError, DomainResult, ValueObject};

/// How often a value is expected to be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingFrequency {
    Weekly,
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
}

/// Type tag of a recorded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Baseline,
    Target,
    Current,
}

/// One declared breakdown axis, e.g. `gender: [female, male, other]`.
///
/// Slices on recorded values may only reference pairs declared here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisaggregationCategory {
    pub name: String,
    pub subcategories: Vec<String>,
}

impl ValueObject for DisaggregationCategory {}

impl DisaggregationCategory {
    pub fn new(name: impl Into<String>, subcategories: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subcategories,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("disaggregation category name cannot be empty"));
        }
        if self.subcategories.is_empty() {
            return Err(DomainError::validation(format!(
                "disaggregation category '{}' must declare at least one subcategory",
                self.name
            )));
        }
        for (i, sub) in self.subcategories.iter().enumerate() {
            if sub.trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "disaggregation category '{}' has an empty subcategory",
                    self.name
                )));
            }
            if self.subcategories[..i].contains(sub) {
                return Err(DomainError::validation(format!(
                    "duplicate subcategory '{}' in category '{}'",
                    sub, self.name
                )));
            }
        }
        Ok(())
    }

    pub fn declares(&self, subcategory: &str) -> bool {
        self.subcategories.iter().any(|s| s == subcategory)
    }
}

/// Validate a full disaggregation field set: each category valid, names
/// distinct.
pub fn validate_disaggregation(set: &[DisaggregationCategory]) -> DomainResult<()> {
    for (i, cat) in set.iter().enumerate() {
        cat.validate()?;
        if set[..i].iter().any(|c| c.name == cat.name) {
            return Err(DomainError::validation(format!(
                "duplicate disaggregation category '{}'",
                cat.name
            )));
        }
    }
    Ok(())
}

/// Ordered rating scale for qualitative indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingScale {
    pub levels: Vec<String>,
}

impl ValueObject for RatingScale {}

impl RatingScale {
    pub fn new(levels: Vec<String>) -> Self {
        Self { levels }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.levels.is_empty() {
            return Err(DomainError::validation("rating scale must declare at least one level"));
        }
        for (i, level) in self.levels.iter().enumerate() {
            if level.trim().is_empty() {
                return Err(DomainError::validation("rating scale level cannot be empty"));
            }
            if self.levels[..i].contains(level) {
                return Err(DomainError::validation(format!(
                    "duplicate rating scale level '{level}'"
                )));
            }
        }
        Ok(())
    }

    pub fn contains(&self, level: &str) -> bool {
        self.levels.iter().any(|l| l == level)
    }
}

/// The payload of a recorded value: numeric for quantitative indicators,
/// a rating (with optional narrative) for qualitative ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeasurementValue {
    Numeric { amount: f64 },
    Rating {
        level: String,
        narrative: Option<String>,
    },
}

impl MeasurementValue {
    pub fn numeric(amount: f64) -> Self {
        Self::Numeric { amount }
    }

    pub fn rating(level: impl Into<String>, narrative: Option<String>) -> Self {
        Self::Rating {
            level: level.into(),
            narrative,
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Numeric { amount } => Some(*amount),
            Self::Rating { .. } => None,
        }
    }
}

/// One breakdown slice of its parent value (category × subcategory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisaggregatedSlice {
    pub category: String,
    pub subcategory: String,
    pub value: f64,
}

/// One point of an indicator's history. Append-only once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedValue {
    pub kind: ValueKind,
    pub value: MeasurementValue,
    pub measured_at: NaiveDate,
    pub source: String,
    pub slices: Vec<DisaggregatedSlice>,
}
