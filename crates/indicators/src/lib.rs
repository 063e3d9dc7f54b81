//! `pulse-indicators` — the indicator domain.
//!
//! An indicator is a tracked measurement definition: quantitative (a unit,
//! optional baseline/target, a calculation method) or qualitative (a rating
//! scale with assessment criteria). Values are appended over time, each
//! optionally broken down into disaggregation slices (e.g. gender × age
//! band), and are never mutated in place.

pub mod calculation;
pub mod formula;
pub mod indicator;
pub mod measure;

pub use calculation::{
    AggregateFn, CalculationError, CalculationMethod, SeriesInputs, SeriesPoint, SliceFilter,
    evaluate,
};
pub use formula::{Formula, FormulaError, FormulaVariable};
pub use indicator::{
    DefineIndicator, Indicator, IndicatorCommand, IndicatorDefined, IndicatorEvent, IndicatorId,
    IndicatorRetired, IndicatorRevised, IndicatorSpec, IndicatorStatus, QualitativeSpec,
    QuantitativeSpec, RecordValue, RetireIndicator, ReviseIndicator, ValueRecorded,
};
pub use measure::{
    DisaggregatedSlice, DisaggregationCategory, MeasurementValue, RatingScale, RecordedValue,
    ReportingFrequency, ValueKind,
};
