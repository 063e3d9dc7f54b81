use chrono::NaiveDate;
use serde::Deserialize;

use pulse_indicators::{
    CalculationMethod, DisaggregatedSlice, DisaggregationCategory, IndicatorSpec,
    MeasurementValue, ReportingFrequency, SliceFilter, ValueKind,
};
use pulse_infra::projections::{IndicatorReadModel, ProgressReadModel, ValueSeriesReadModel};
use pulse_infra::workers::RollupSnapshot;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct DefineIndicatorRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub frequency: ReportingFrequency,
    #[serde(default)]
    pub disaggregation: Vec<DisaggregationCategory>,
    pub spec: IndicatorSpec,
}

#[derive(Debug, Deserialize)]
pub struct ReviseIndicatorRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub frequency: Option<ReportingFrequency>,
    pub disaggregation: Option<Vec<DisaggregationCategory>>,
}

#[derive(Debug, Deserialize)]
pub struct RecordValueRequest {
    pub kind: ValueKind,
    pub value: MeasurementValue,
    pub measured_at: NaiveDate,
    pub source: String,
    #[serde(default)]
    pub slices: Vec<DisaggregatedSlice>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
pub struct CalculateRequest {
    /// Overrides the indicator's configured method when set.
    pub method: Option<CalculationMethod>,
    pub filter: Option<SliceFilter>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ValuesQuery {
    pub kind: Option<ValueKind>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn indicator_to_json(rm: IndicatorReadModel) -> serde_json::Value {
    serde_json::json!({
        "id": rm.indicator_id.0.to_string(),
        "name": rm.name,
        "description": rm.description,
        "frequency": frequency_str(rm.frequency),
        "status": format!("{:?}", rm.status).to_lowercase(),
        "kind": rm.kind,
        "unit": rm.unit,
        "baseline": rm.baseline,
        "target": rm.target,
        "scale": rm.scale,
        "disaggregation": rm.disaggregation.iter().map(|c| serde_json::json!({
            "name": c.name,
            "subcategories": c.subcategories,
        })).collect::<Vec<_>>(),
        "value_count": rm.value_count,
        "last_current_date": rm.last_current_date.map(|d| d.to_string()),
    })
}

pub fn series_to_json(rm: ValueSeriesReadModel, kind: Option<ValueKind>, limit: u32, offset: u32) -> serde_json::Value {
    let filtered: Vec<_> = rm
        .points
        .iter()
        .filter(|p| kind.is_none_or(|k| p.kind == k))
        .collect();
    let total = filtered.len();
    let page = filtered
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .map(|p| {
            serde_json::json!({
                "kind": kind_str(p.kind),
                "value": measurement_to_json(&p.value),
                "measured_at": p.measured_at.to_string(),
                "source": p.source,
                "slices": p.slices.iter().map(|s| serde_json::json!({
                    "category": s.category,
                    "subcategory": s.subcategory,
                    "value": s.value,
                })).collect::<Vec<_>>(),
            })
        })
        .collect::<Vec<_>>();

    serde_json::json!({
        "indicator_id": rm.indicator_id.0.to_string(),
        "total": total,
        "items": page,
    })
}

pub fn progress_to_json(rm: ProgressReadModel) -> serde_json::Value {
    serde_json::json!({
        "indicator_id": rm.indicator_id.0.to_string(),
        "name": rm.name,
        "unit": rm.unit,
        "baseline": rm.baseline,
        "target": rm.target,
        "latest": rm.latest,
        "latest_date": rm.latest_date.map(|d| d.to_string()),
        "achievement_pct": rm.achievement_pct,
    })
}

pub fn rollup_to_json(snapshot: RollupSnapshot) -> serde_json::Value {
    serde_json::json!({
        "indicator_id": snapshot.indicator_id.0.to_string(),
        "name": snapshot.name,
        "value": snapshot.value,
        "error": snapshot.error,
        "computed_at": snapshot.computed_at.to_rfc3339(),
    })
}

pub fn measurement_to_json(value: &MeasurementValue) -> serde_json::Value {
    match value {
        MeasurementValue::Numeric { amount } => serde_json::json!({
            "type": "numeric",
            "amount": amount,
        }),
        MeasurementValue::Rating { level, narrative } => serde_json::json!({
            "type": "rating",
            "level": level,
            "narrative": narrative,
        }),
    }
}

fn frequency_str(frequency: ReportingFrequency) -> &'static str {
    match frequency {
        ReportingFrequency::Weekly => "weekly",
        ReportingFrequency::Monthly => "monthly",
        ReportingFrequency::Quarterly => "quarterly",
        ReportingFrequency::SemiAnnual => "semi_annual",
        ReportingFrequency::Annual => "annual",
    }
}

pub fn kind_str(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Baseline => "baseline",
        ValueKind::Target => "target",
        ValueKind::Current => "current",
    }
}
