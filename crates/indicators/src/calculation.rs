//! Calculation methods: named aggregations applied over an indicator's
//! current value series, optionally restricted to a disaggregation slice.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::formula::{Formula, FormulaError};
use crate::measure::{RecordedValue, ValueKind};

/// Restricts inputs to one disaggregation slice. Without a subcategory, all
/// slices of the category match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceFilter {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
}

/// Aggregation primitive used by formula variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Sum,
    Average,
    Count,
    Min,
    Max,
}

/// A named calculation method. `Custom` carries a stored formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CalculationMethod {
    Sum,
    Average,
    Percentage,
    Count,
    Custom(Formula),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalculationError {
    /// The aggregation has no inputs to work with.
    EmptyInput,
    /// `Percentage` needs a slice filter as numerator.
    MissingFilter,
    DivisionByZero,
    Formula(FormulaError),
}

impl core::fmt::Display for CalculationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CalculationError::EmptyInput => write!(f, "no input values for calculation"),
            CalculationError::MissingFilter => {
                write!(f, "percentage calculation requires a slice filter")
            }
            CalculationError::DivisionByZero => write!(f, "division by zero"),
            CalculationError::Formula(e) => write!(f, "formula error: {e}"),
        }
    }
}

impl std::error::Error for CalculationError {}

impl From<FormulaError> for CalculationError {
    fn from(value: FormulaError) -> Self {
        match value {
            FormulaError::DivisionByZero => CalculationError::DivisionByZero,
            other => CalculationError::Formula(other),
        }
    }
}

/// One point offered to a calculation: the top-level numeric value (absent
/// for qualitative ratings) plus its slices.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub value: Option<f64>,
    pub slices: Vec<(String, String, f64)>,
}

/// The calculation input set, extracted from a value series.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeriesInputs {
    points: Vec<SeriesPoint>,
}

impl SeriesInputs {
    pub fn new(points: Vec<SeriesPoint>) -> Self {
        Self { points }
    }

    /// Build from a recorded history, keeping only `Current` values.
    pub fn from_recorded<'a>(values: impl IntoIterator<Item = &'a RecordedValue>) -> Self {
        let points = values
            .into_iter()
            .filter(|v| v.kind == ValueKind::Current)
            .map(|v| SeriesPoint {
                value: v.value.as_numeric(),
                slices: v
                    .slices
                    .iter()
                    .map(|s| (s.category.clone(), s.subcategory.clone(), s.value))
                    .collect(),
            })
            .collect();
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Top-level numeric values.
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().filter_map(|p| p.value).collect()
    }

    /// Slice values matching a filter.
    pub fn filtered(&self, filter: &SliceFilter) -> Vec<f64> {
        self.points
            .iter()
            .flat_map(|p| p.slices.iter())
            .filter(|(cat, sub, _)| {
                *cat == filter.category
                    && filter.subcategory.as_ref().is_none_or(|want| sub == want)
            })
            .map(|(_, _, v)| *v)
            .collect()
    }

    fn select(&self, filter: Option<&SliceFilter>) -> Vec<f64> {
        match filter {
            Some(f) => self.filtered(f),
            None => self.values(),
        }
    }
}

/// Apply a calculation method over the inputs.
///
/// The optional `filter` narrows `Sum`/`Average`/`Count` to one slice and is
/// the required numerator for `Percentage`. `Custom` formulas ignore it:
/// their variables carry their own filters.
pub fn evaluate(
    method: &CalculationMethod,
    inputs: &SeriesInputs,
    filter: Option<&SliceFilter>,
) -> Result<f64, CalculationError> {
    match method {
        CalculationMethod::Sum => Ok(inputs.select(filter).iter().sum()),
        CalculationMethod::Count => match filter {
            Some(f) => Ok(inputs.filtered(f).len() as f64),
            None => Ok(inputs.len() as f64),
        },
        CalculationMethod::Average => {
            let values = inputs.select(filter);
            if values.is_empty() {
                return Err(CalculationError::EmptyInput);
            }
            Ok(values.iter().sum::<f64>() / values.len() as f64)
        }
        CalculationMethod::Percentage => {
            let filter = filter.ok_or(CalculationError::MissingFilter)?;
            let whole: f64 = inputs.values().iter().sum();
            if whole == 0.0 {
                return Err(CalculationError::DivisionByZero);
            }
            let part: f64 = inputs.filtered(filter).iter().sum();
            Ok(part / whole * 100.0)
        }
        CalculationMethod::Custom(formula) => {
            let mut bindings = HashMap::with_capacity(formula.variables.len());
            for var in &formula.variables {
                let values = inputs.select(var.filter.as_ref());
                bindings.insert(var.name.clone(), apply_aggregate(var.aggregate, &values)?);
            }
            Ok(formula.evaluate(&bindings)?)
        }
    }
}

fn apply_aggregate(agg: AggregateFn, values: &[f64]) -> Result<f64, CalculationError> {
    match agg {
        AggregateFn::Sum => Ok(values.iter().sum()),
        AggregateFn::Count => Ok(values.len() as f64),
        AggregateFn::Average => {
            if values.is_empty() {
                return Err(CalculationError::EmptyInput);
            }
            Ok(values.iter().sum::<f64>() / values.len() as f64)
        }
        AggregateFn::Min => values
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
            .ok_or(CalculationError::EmptyInput),
        AggregateFn::Max => values
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
            .ok_or(CalculationError::EmptyInput),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::FormulaVariable;

    fn point(value: f64, slices: &[(&str, &str, f64)]) -> SeriesPoint {
        SeriesPoint {
            value: Some(value),
            slices: slices
                .iter()
                .map(|(c, s, v)| (c.to_string(), s.to_string(), *v))
                .collect(),
        }
    }

    fn inputs() -> SeriesInputs {
        SeriesInputs::new(vec![
            point(100.0, &[("gender", "female", 60.0), ("gender", "male", 40.0)]),
            point(50.0, &[("gender", "female", 20.0), ("gender", "male", 30.0)]),
        ])
    }

    fn female() -> SliceFilter {
        SliceFilter {
            category: "gender".to_string(),
            subcategory: Some("female".to_string()),
        }
    }

    #[test]
    fn sum_over_values() {
        assert_eq!(evaluate(&CalculationMethod::Sum, &inputs(), None).unwrap(), 150.0);
    }

    #[test]
    fn sum_over_filtered_slices() {
        assert_eq!(
            evaluate(&CalculationMethod::Sum, &inputs(), Some(&female())).unwrap(),
            80.0
        );
    }

    #[test]
    fn category_filter_without_subcategory_matches_all_slices() {
        let filter = SliceFilter {
            category: "gender".to_string(),
            subcategory: None,
        };
        assert_eq!(
            evaluate(&CalculationMethod::Sum, &inputs(), Some(&filter)).unwrap(),
            150.0
        );
    }

    #[test]
    fn average_over_values() {
        assert_eq!(
            evaluate(&CalculationMethod::Average, &inputs(), None).unwrap(),
            75.0
        );
    }

    #[test]
    fn average_of_nothing_is_an_error() {
        let empty = SeriesInputs::default();
        assert_eq!(
            evaluate(&CalculationMethod::Average, &empty, None),
            Err(CalculationError::EmptyInput)
        );
    }

    #[test]
    fn count_points_and_count_slices() {
        assert_eq!(evaluate(&CalculationMethod::Count, &inputs(), None).unwrap(), 2.0);
        assert_eq!(
            evaluate(&CalculationMethod::Count, &inputs(), Some(&female())).unwrap(),
            2.0
        );
    }

    #[test]
    fn percentage_requires_filter() {
        assert_eq!(
            evaluate(&CalculationMethod::Percentage, &inputs(), None),
            Err(CalculationError::MissingFilter)
        );
    }

    #[test]
    fn percentage_of_slice_over_whole() {
        let pct = evaluate(&CalculationMethod::Percentage, &inputs(), Some(&female())).unwrap();
        assert!((pct - (80.0 / 150.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn percentage_with_zero_whole_is_an_error() {
        let zero = SeriesInputs::new(vec![point(0.0, &[("gender", "female", 0.0)])]);
        assert_eq!(
            evaluate(&CalculationMethod::Percentage, &zero, Some(&female())),
            Err(CalculationError::DivisionByZero)
        );
    }

    #[test]
    fn custom_formula_binds_aggregated_variables() {
        let method = CalculationMethod::Custom(Formula {
            expression: "female / total * 100".to_string(),
            variables: vec![
                FormulaVariable {
                    name: "female".to_string(),
                    aggregate: AggregateFn::Sum,
                    filter: Some(female()),
                },
                FormulaVariable {
                    name: "total".to_string(),
                    aggregate: AggregateFn::Sum,
                    filter: None,
                },
            ],
        });

        let pct = evaluate(&method, &inputs(), None).unwrap();
        assert!((pct - (80.0 / 150.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn custom_formula_min_max() {
        let method = CalculationMethod::Custom(Formula {
            expression: "hi - lo".to_string(),
            variables: vec![
                FormulaVariable {
                    name: "hi".to_string(),
                    aggregate: AggregateFn::Max,
                    filter: None,
                },
                FormulaVariable {
                    name: "lo".to_string(),
                    aggregate: AggregateFn::Min,
                    filter: None,
                },
            ],
        });
        assert_eq!(evaluate(&method, &inputs(), None).unwrap(), 50.0);
    }

    #[test]
    fn custom_formula_division_by_zero_surfaces() {
        let method = CalculationMethod::Custom(Formula {
            expression: "1 / total".to_string(),
            variables: vec![FormulaVariable {
                name: "total".to_string(),
                aggregate: AggregateFn::Sum,
                filter: None,
            }],
        });
        let empty = SeriesInputs::default();
        assert_eq!(
            evaluate(&method, &empty, None),
            Err(CalculationError::DivisionByZero)
        );
    }

    #[test]
    fn qualitative_points_have_no_top_level_values() {
        let inputs = SeriesInputs::new(vec![SeriesPoint {
            value: None,
            slices: vec![("gender".to_string(), "female".to_string(), 12.0)],
        }]);
        assert_eq!(evaluate(&CalculationMethod::Sum, &inputs, None).unwrap(), 0.0);
        assert_eq!(evaluate(&CalculationMethod::Count, &inputs, None).unwrap(), 1.0);
        assert_eq!(
            evaluate(
                &CalculationMethod::Sum,
                &inputs,
                Some(&SliceFilter {
                    category: "gender".to_string(),
                    subcategory: Some("female".to_string())
                })
            )
            .unwrap(),
            12.0
        );
    }

    #[test]
    fn method_serde_is_tagged() {
        let json = serde_json::to_value(CalculationMethod::Average).unwrap();
        assert_eq!(json["method"], "average");

        let parsed: CalculationMethod =
            serde_json::from_value(serde_json::json!({ "method": "sum" })).unwrap();
        assert_eq!(parsed, CalculationMethod::Sum);
    }
}
