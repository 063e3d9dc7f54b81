//! Progress: achievement-against-target per quantitative indicator.
//!
//! Achievement is `(latest − baseline) / (target − baseline) × 100`, with a
//! missing baseline treated as 0. Qualitative indicators have no progress
//! entry.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value as JsonValue;

use pulse_core::TenantId;
use pulse_events::EventEnvelope;
use pulse_indicators::{
    IndicatorEvent, IndicatorId, IndicatorSpec, MeasurementValue, ValueKind,
};

use super::registry::{AGGREGATE_TYPE, event_scope};
use super::{CursorStep, ProjectionError, StreamCursors};
use crate::read_model::TenantStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReadModel {
    pub indicator_id: IndicatorId,
    pub name: String,
    pub unit: String,
    pub baseline: Option<f64>,
    pub target: Option<f64>,
    pub latest: Option<f64>,
    pub latest_date: Option<NaiveDate>,
    pub achievement_pct: Option<f64>,
}

impl ProgressReadModel {
    fn recompute(&mut self) {
        self.achievement_pct = match (self.latest, self.target) {
            (Some(latest), Some(target)) => {
                let baseline = self.baseline.unwrap_or(0.0);
                let span = target - baseline;
                if span == 0.0 {
                    None
                } else {
                    Some((latest - baseline) / span * 100.0)
                }
            }
            _ => None,
        };
    }
}

#[derive(Debug)]
pub struct ProgressProjection<S>
where
    S: TenantStore<IndicatorId, ProgressReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> ProgressProjection<S>
where
    S: TenantStore<IndicatorId, ProgressReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(&self, tenant_id: TenantId, indicator_id: &IndicatorId) -> Option<ProgressReadModel> {
        self.store.get(tenant_id, indicator_id)
    }

    pub fn list(&self, tenant_id: TenantId) -> Vec<ProgressReadModel> {
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
        if event_tenant != tenant_id || indicator_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event scope does not match envelope scope".to_string(),
            ));
        }

        match ev {
            IndicatorEvent::IndicatorDefined(e) => {
                if let IndicatorSpec::Quantitative(q) = &e.spec {
                    let mut rm = ProgressReadModel {
                        indicator_id: e.indicator_id,
                        name: e.name,
                        unit: q.unit.clone(),
                        baseline: q.baseline,
                        target: q.target,
                        latest: None,
                        latest_date: None,
                        achievement_pct: None,
                    };
                    rm.recompute();
                    self.store.upsert(tenant_id, e.indicator_id, rm);
                }
            }
            IndicatorEvent::IndicatorRevised(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.indicator_id) {
                    if let Some(name) = e.name {
                        rm.name = name;
                    }
                    self.store.upsert(tenant_id, e.indicator_id, rm);
                }
            }
            IndicatorEvent::ValueRecorded(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.indicator_id) {
                    if let MeasurementValue::Numeric { amount } = e.value {
                        match e.kind {
                            ValueKind::Current => {
                                rm.latest = Some(amount);
                                rm.latest_date = Some(e.measured_at);
                            }
                            ValueKind::Baseline => rm.baseline = Some(amount),
                            ValueKind::Target => rm.target = Some(amount),
                        }
                        rm.recompute();
                        self.store.upsert(tenant_id, e.indicator_id, rm);
                    }
                }
            }
            // Retired indicators keep their last computed progress.
            IndicatorEvent::IndicatorRetired(_) => {}
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }
}
