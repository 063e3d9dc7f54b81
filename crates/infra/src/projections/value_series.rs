//! Value series: the ordered history of recorded values per indicator.

use chrono::NaiveDate;
use serde_json::Value as JsonValue;

use pulse_core::TenantId;
use pulse_events::EventEnvelope;
use pulse_indicators::{
    DisaggregatedSlice, IndicatorEvent, IndicatorId, MeasurementValue, SeriesInputs, SeriesPoint,
    ValueKind,
};

use super::registry::{AGGREGATE_TYPE, event_scope};
use super::{CursorStep, ProjectionError, StreamCursors};
use crate::read_model::TenantStore;

/// One recorded point, as exposed to queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuePoint {
    pub kind: ValueKind,
    pub value: MeasurementValue,
    pub measured_at: NaiveDate,
    pub source: String,
    pub slices: Vec<DisaggregatedSlice>,
}

/// The full history of one indicator, in recorded order.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSeriesReadModel {
    pub indicator_id: IndicatorId,
    pub points: Vec<ValuePoint>,
}

impl ValueSeriesReadModel {
    /// Calculation inputs: the current series only.
    pub fn inputs(&self) -> SeriesInputs {
        SeriesInputs::new(
            self.points
                .iter()
                .filter(|p| p.kind == ValueKind::Current)
                .map(|p| SeriesPoint {
                    value: p.value.as_numeric(),
                    slices: p
                        .slices
                        .iter()
                        .map(|s| (s.category.clone(), s.subcategory.clone(), s.value))
                        .collect(),
                })
                .collect(),
        )
    }
}

#[derive(Debug)]
pub struct ValueSeriesProjection<S>
where
    S: TenantStore<IndicatorId, ValueSeriesReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> ValueSeriesProjection<S>
where
    S: TenantStore<IndicatorId, ValueSeriesReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        indicator_id: &IndicatorId,
    ) -> Option<ValueSeriesReadModel> {
        self.store.get(tenant_id, indicator_id)
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
                self.store.upsert(
                    tenant_id,
                    e.indicator_id,
                    ValueSeriesReadModel {
                        indicator_id: e.indicator_id,
                        points: Vec::new(),
                    },
                );
            }
            IndicatorEvent::ValueRecorded(e) => {
                let mut rm =
                    self.store
                        .get(tenant_id, &e.indicator_id)
                        .unwrap_or(ValueSeriesReadModel {
                            indicator_id: e.indicator_id,
                            points: Vec::new(),
                        });
                rm.points.push(ValuePoint {
                    kind: e.kind,
                    value: e.value,
                    measured_at: e.measured_at,
                    source: e.source,
                    slices: e.slices,
                });
                self.store.upsert(tenant_id, e.indicator_id, rm);
            }
            // History survives revision and retirement untouched.
            IndicatorEvent::IndicatorRevised(_) | IndicatorEvent::IndicatorRetired(_) => {}
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }
}
