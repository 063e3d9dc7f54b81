//! Indicator registry: the queryable catalog of indicator definitions.

use chrono::NaiveDate;
use serde_json::Value as JsonValue;

use pulse_core::TenantId;
use pulse_events::EventEnvelope;
use pulse_indicators::{
    CalculationMethod, DisaggregationCategory, IndicatorEvent, IndicatorId, IndicatorSpec,
    IndicatorStatus, MeasurementValue, ReportingFrequency, ValueKind,
};

use super::{CursorStep, ProjectionError, StreamCursors};
use crate::read_model::TenantStore;

pub const AGGREGATE_TYPE: &str = "indicators.indicator";

/// Catalog entry for one indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorReadModel {
    pub indicator_id: IndicatorId,
    pub name: String,
    pub description: String,
    pub frequency: ReportingFrequency,
    pub status: IndicatorStatus,
    /// "quantitative" or "qualitative".
    pub kind: String,
    pub unit: Option<String>,
    pub baseline: Option<f64>,
    pub target: Option<f64>,
    pub scale: Option<Vec<String>>,
    /// Configured calculation (quantitative indicators only).
    pub calculation: Option<CalculationMethod>,
    pub disaggregation: Vec<DisaggregationCategory>,
    pub value_count: u64,
    pub last_current_date: Option<NaiveDate>,
}

#[derive(Debug)]
pub struct IndicatorRegistryProjection<S>
where
    S: TenantStore<IndicatorId, IndicatorReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> IndicatorRegistryProjection<S>
where
    S: TenantStore<IndicatorId, IndicatorReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(&self, tenant_id: TenantId, indicator_id: &IndicatorId) -> Option<IndicatorReadModel> {
        self.store.get(tenant_id, indicator_id)
    }

    /// All indicators for a tenant, name-ordered for stable listings.
    pub fn list(&self, tenant_id: TenantId) -> Vec<IndicatorReadModel> {
        let mut items = self.store.list(tenant_id);
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != AGGREGATE_TYPE {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if self.cursors.check(tenant_id, aggregate_id, seq)? == CursorStep::Skip {
            return Ok(());
        }

        let ev: IndicatorEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, indicator_id) = event_scope(&ev);
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if indicator_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event indicator_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            IndicatorEvent::IndicatorDefined(e) => {
                let summary = spec_summary(&e.spec);
                self.store.upsert(
                    tenant_id,
                    e.indicator_id,
                    IndicatorReadModel {
                        indicator_id: e.indicator_id,
                        name: e.name,
                        description: e.description,
                        frequency: e.frequency,
                        status: IndicatorStatus::Active,
                        kind: summary.kind,
                        unit: summary.unit,
                        baseline: summary.baseline,
                        target: summary.target,
                        scale: summary.scale,
                        calculation: summary.calculation,
                        disaggregation: e.disaggregation,
                        value_count: 0,
                        last_current_date: None,
                    },
                );
            }
            IndicatorEvent::IndicatorRevised(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.indicator_id) {
                    if let Some(name) = e.name {
                        rm.name = name;
                    }
                    if let Some(description) = e.description {
                        rm.description = description;
                    }
                    if let Some(frequency) = e.frequency {
                        rm.frequency = frequency;
                    }
                    if let Some(disaggregation) = e.disaggregation {
                        rm.disaggregation = disaggregation;
                    }
                    self.store.upsert(tenant_id, e.indicator_id, rm);
                }
            }
            IndicatorEvent::ValueRecorded(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.indicator_id) {
                    rm.value_count += 1;
                    if e.kind == ValueKind::Current {
                        rm.last_current_date = Some(e.measured_at);
                    }
                    // Baseline/target points supersede the configured spec
                    // values in the catalog view.
                    if let MeasurementValue::Numeric { amount } = e.value {
                        match e.kind {
                            ValueKind::Baseline => rm.baseline = Some(amount),
                            ValueKind::Target => rm.target = Some(amount),
                            ValueKind::Current => {}
                        }
                    }
                    self.store.upsert(tenant_id, e.indicator_id, rm);
                }
            }
            IndicatorEvent::IndicatorRetired(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.indicator_id) {
                    rm.status = IndicatorStatus::Retired;
                    self.store.upsert(tenant_id, e.indicator_id, rm);
                }
            }
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }

    /// Wipe and re-apply, e.g. after a schema change.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();

        let mut tenants: Vec<_> = envs.iter().map(|e| e.tenant_id()).collect();
        tenants.sort_by_key(|t| *t.as_uuid().as_bytes());
        tenants.dedup();
        for t in tenants {
            self.store.clear_tenant(t);
            self.cursors.clear_tenant(t);
        }

        envs.sort_by_key(|e| {
            (
                *e.tenant_id().as_uuid().as_bytes(),
                *e.aggregate_id().as_uuid().as_bytes(),
                e.sequence_number(),
            )
        });

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}

pub(crate) fn event_scope(ev: &IndicatorEvent) -> (TenantId, IndicatorId) {
    match ev {
        IndicatorEvent::IndicatorDefined(e) => (e.tenant_id, e.indicator_id),
        IndicatorEvent::IndicatorRevised(e) => (e.tenant_id, e.indicator_id),
        IndicatorEvent::ValueRecorded(e) => (e.tenant_id, e.indicator_id),
        IndicatorEvent::IndicatorRetired(e) => (e.tenant_id, e.indicator_id),
    }
}

struct SpecSummary {
    kind: String,
    unit: Option<String>,
    baseline: Option<f64>,
    target: Option<f64>,
    scale: Option<Vec<String>>,
    calculation: Option<CalculationMethod>,
}

fn spec_summary(spec: &IndicatorSpec) -> SpecSummary {
    match spec {
        IndicatorSpec::Quantitative(q) => SpecSummary {
            kind: "quantitative".to_string(),
            unit: Some(q.unit.clone()),
            baseline: q.baseline,
            target: q.target,
            scale: None,
            calculation: Some(q.calculation.clone()),
        },
        IndicatorSpec::Qualitative(q) => SpecSummary {
            kind: "qualitative".to_string(),
            unit: None,
            baseline: None,
            target: None,
            scale: Some(q.scale.levels.clone()),
            calculation: None,
        },
    }
}
