use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use pulse_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use pulse_events::Event;

use crate::calculation::CalculationMethod;
use crate::measure::{
    DisaggregatedSlice, DisaggregationCategory, MeasurementValue, RatingScale, RecordedValue,
    ReportingFrequency, ValueKind, validate_disaggregation,
};

/// Indicator identifier (tenant-scoped via `tenant_id` fields in
/// events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorId(pub AggregateId);

impl IndicatorId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for IndicatorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Indicator lifecycle. Retirement is terminal: history stays readable, new
/// commands are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorStatus {
    Active,
    Retired,
}

/// Configuration of a quantitative indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantitativeSpec {
    /// Unit of measurement, e.g. "households" or "%".
    pub unit: String,
    pub baseline: Option<f64>,
    pub target: Option<f64>,
    pub calculation: CalculationMethod,
}

/// Configuration of a qualitative indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitativeSpec {
    pub scale: RatingScale,
    pub narrative_template: Option<String>,
    pub assessment_criteria: Vec<String>,
}

/// The variant split: one abstract indicator, two concrete shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Quantitative(QuantitativeSpec),
    Qualitative(QualitativeSpec),
}

impl IndicatorSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            IndicatorSpec::Quantitative(_) => "quantitative",
            IndicatorSpec::Qualitative(_) => "qualitative",
        }
    }

    fn validate(&self) -> Result<(), DomainError> {
        match self {
            IndicatorSpec::Quantitative(spec) => {
                if spec.unit.trim().is_empty() {
                    return Err(DomainError::validation("unit of measurement cannot be empty"));
                }
                for (label, value) in [("baseline", spec.baseline), ("target", spec.target)] {
                    if let Some(v) = value {
                        if !v.is_finite() {
                            return Err(DomainError::validation(format!("{label} must be finite")));
                        }
                    }
                }
                if let CalculationMethod::Custom(formula) = &spec.calculation {
                    formula
                        .validate()
                        .map_err(|e| DomainError::validation(format!("invalid formula: {e}")))?;
                }
                Ok(())
            }
            IndicatorSpec::Qualitative(spec) => {
                spec.scale.validate()?;
                if spec.assessment_criteria.iter().any(|c| c.trim().is_empty()) {
                    return Err(DomainError::validation("assessment criteria cannot be empty"));
                }
                Ok(())
            }
        }
    }
}

/// Aggregate root: Indicator.
///
/// Owns its value history: values are appended through `RecordValue` and are
/// never mutated or removed, so rehydrating from the event stream always
/// reproduces the full history.
#[derive(Debug, Clone, PartialEq)]
pub struct Indicator {
    id: IndicatorId,
    tenant_id: Option<TenantId>,
    name: String,
    description: String,
    frequency: ReportingFrequency,
    disaggregation: Vec<DisaggregationCategory>,
    spec: IndicatorSpec,
    status: IndicatorStatus,
    values: Vec<RecordedValue>,
    version: u64,
    created: bool,
}

impl Indicator {
    /// Create an empty, not-yet-defined instance for rehydration.
    pub fn empty(id: IndicatorId) -> Self {
        Self {
            id,
            tenant_id: None,
            name: String::new(),
            description: String::new(),
            frequency: ReportingFrequency::Monthly,
            disaggregation: Vec::new(),
            spec: IndicatorSpec::Quantitative(QuantitativeSpec {
                unit: String::new(),
                baseline: None,
                target: None,
                calculation: CalculationMethod::Sum,
            }),
            status: IndicatorStatus::Active,
            values: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> IndicatorId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn frequency(&self) -> ReportingFrequency {
        self.frequency
    }

    pub fn disaggregation(&self) -> &[DisaggregationCategory] {
        &self.disaggregation
    }

    pub fn spec(&self) -> &IndicatorSpec {
        &self.spec
    }

    pub fn status(&self) -> IndicatorStatus {
        self.status
    }

    pub fn values(&self) -> &[RecordedValue] {
        &self.values
    }

    pub fn is_retired(&self) -> bool {
        self.status == IndicatorStatus::Retired
    }

    /// The single current series, in recorded (= date) order.
    pub fn current_series(&self) -> impl Iterator<Item = &RecordedValue> {
        self.values.iter().filter(|v| v.kind == ValueKind::Current)
    }

    pub fn latest_current_date(&self) -> Option<NaiveDate> {
        self.values
            .iter()
            .filter(|v| v.kind == ValueKind::Current)
            .map(|v| v.measured_at)
            .last()
    }
}

impl AggregateRoot for Indicator {
    type Id = IndicatorId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: DefineIndicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefineIndicator {
    pub tenant_id: TenantId,
    pub indicator_id: IndicatorId,
    pub name: String,
    pub description: String,
    pub frequency: ReportingFrequency,
    pub disaggregation: Vec<DisaggregationCategory>,
    pub spec: IndicatorSpec,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReviseIndicator. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviseIndicator {
    pub tenant_id: TenantId,
    pub indicator_id: IndicatorId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub frequency: Option<ReportingFrequency>,
    pub disaggregation: Option<Vec<DisaggregationCategory>>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordValue (append one value + breakdown slices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordValue {
    pub tenant_id: TenantId,
    pub indicator_id: IndicatorId,
    pub kind: ValueKind,
    pub value: MeasurementValue,
    pub measured_at: NaiveDate,
    pub source: String,
    pub slices: Vec<DisaggregatedSlice>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RetireIndicator (explicit delete).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetireIndicator {
    pub tenant_id: TenantId,
    pub indicator_id: IndicatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndicatorCommand {
    DefineIndicator(DefineIndicator),
    ReviseIndicator(ReviseIndicator),
    RecordValue(RecordValue),
    RetireIndicator(RetireIndicator),
}

/// Event: IndicatorDefined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDefined {
    pub tenant_id: TenantId,
    pub indicator_id: IndicatorId,
    pub name: String,
    pub description: String,
    pub frequency: ReportingFrequency,
    pub disaggregation: Vec<DisaggregationCategory>,
    pub spec: IndicatorSpec,
    pub occurred_at: DateTime<Utc>,
}

/// Event: IndicatorRevised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRevised {
    pub tenant_id: TenantId,
    pub indicator_id: IndicatorId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub frequency: Option<ReportingFrequency>,
    pub disaggregation: Option<Vec<DisaggregationCategory>>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ValueRecorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecorded {
    pub tenant_id: TenantId,
    pub indicator_id: IndicatorId,
    pub kind: ValueKind,
    pub value: MeasurementValue,
    pub measured_at: NaiveDate,
    pub source: String,
    pub slices: Vec<DisaggregatedSlice>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: IndicatorRetired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRetired {
    pub tenant_id: TenantId,
    pub indicator_id: IndicatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndicatorEvent {
    IndicatorDefined(IndicatorDefined),
    IndicatorRevised(IndicatorRevised),
    ValueRecorded(ValueRecorded),
    IndicatorRetired(IndicatorRetired),
}

impl Event for IndicatorEvent {
    fn event_type(&self) -> &'static str {
        match self {
            IndicatorEvent::IndicatorDefined(_) => "indicators.indicator.defined",
            IndicatorEvent::IndicatorRevised(_) => "indicators.indicator.revised",
            IndicatorEvent::ValueRecorded(_) => "indicators.indicator.value_recorded",
            IndicatorEvent::IndicatorRetired(_) => "indicators.indicator.retired",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            IndicatorEvent::IndicatorDefined(e) => e.occurred_at,
            IndicatorEvent::IndicatorRevised(e) => e.occurred_at,
            IndicatorEvent::ValueRecorded(e) => e.occurred_at,
            IndicatorEvent::IndicatorRetired(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Indicator {
    type Command = IndicatorCommand;
    type Event = IndicatorEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            IndicatorEvent::IndicatorDefined(e) => {
                self.id = e.indicator_id;
                self.tenant_id = Some(e.tenant_id);
                self.name = e.name.clone();
                self.description = e.description.clone();
                self.frequency = e.frequency;
                self.disaggregation = e.disaggregation.clone();
                self.spec = e.spec.clone();
                self.status = IndicatorStatus::Active;
                self.values.clear();
                self.created = true;
            }
            IndicatorEvent::IndicatorRevised(e) => {
                if let Some(name) = &e.name {
                    self.name = name.clone();
                }
                if let Some(description) = &e.description {
                    self.description = description.clone();
                }
                if let Some(frequency) = e.frequency {
                    self.frequency = frequency;
                }
                if let Some(disaggregation) = &e.disaggregation {
                    self.disaggregation = disaggregation.clone();
                }
            }
            IndicatorEvent::ValueRecorded(e) => {
                self.values.push(RecordedValue {
                    kind: e.kind,
                    value: e.value.clone(),
                    measured_at: e.measured_at,
                    source: e.source.clone(),
                    slices: e.slices.clone(),
                });
            }
            IndicatorEvent::IndicatorRetired(_) => {
                self.status = IndicatorStatus::Retired;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            IndicatorCommand::DefineIndicator(cmd) => self.handle_define(cmd),
            IndicatorCommand::ReviseIndicator(cmd) => self.handle_revise(cmd),
            IndicatorCommand::RecordValue(cmd) => self.handle_record(cmd),
            IndicatorCommand::RetireIndicator(cmd) => self.handle_retire(cmd),
        }
    }
}

impl Indicator {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_indicator_id(&self, indicator_id: IndicatorId) -> Result<(), DomainError> {
        if self.id != indicator_id {
            return Err(DomainError::invariant("indicator_id mismatch"));
        }
        Ok(())
    }

    fn ensure_not_retired(&self) -> Result<(), DomainError> {
        if self.is_retired() {
            return Err(DomainError::invariant("indicator is retired"));
        }
        Ok(())
    }

    fn handle_define(&self, cmd: &DefineIndicator) -> Result<Vec<IndicatorEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("indicator already exists"));
        }

        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }

        validate_disaggregation(&cmd.disaggregation)?;
        cmd.spec.validate()?;

        Ok(vec![IndicatorEvent::IndicatorDefined(IndicatorDefined {
            tenant_id: cmd.tenant_id,
            indicator_id: cmd.indicator_id,
            name: cmd.name.clone(),
            description: cmd.description.clone(),
            frequency: cmd.frequency,
            disaggregation: cmd.disaggregation.clone(),
            spec: cmd.spec.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_revise(&self, cmd: &ReviseIndicator) -> Result<Vec<IndicatorEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_indicator_id(cmd.indicator_id)?;
        self.ensure_not_retired()?;

        if let Some(name) = &cmd.name {
            if name.trim().is_empty() {
                return Err(DomainError::validation("name cannot be empty"));
            }
        }

        if let Some(disaggregation) = &cmd.disaggregation {
            validate_disaggregation(disaggregation)?;

            // Recorded history must stay explainable: every pair already
            // referenced by a slice has to survive the revision.
            for value in &self.values {
                for slice in &value.slices {
                    let still_declared = disaggregation.iter().any(|c| {
                        c.name == slice.category && c.declares(&slice.subcategory)
                    });
                    if !still_declared {
                        return Err(DomainError::invariant(format!(
                            "cannot remove disaggregation pair '{}/{}' referenced by recorded values",
                            slice.category, slice.subcategory
                        )));
                    }
                }
            }
        }

        if cmd.name.is_none()
            && cmd.description.is_none()
            && cmd.frequency.is_none()
            && cmd.disaggregation.is_none()
        {
            return Err(DomainError::validation("revision must change at least one field"));
        }

        Ok(vec![IndicatorEvent::IndicatorRevised(IndicatorRevised {
            tenant_id: cmd.tenant_id,
            indicator_id: cmd.indicator_id,
            name: cmd.name.clone(),
            description: cmd.description.clone(),
            frequency: cmd.frequency,
            disaggregation: cmd.disaggregation.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record(&self, cmd: &RecordValue) -> Result<Vec<IndicatorEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_indicator_id(cmd.indicator_id)?;
        self.ensure_not_retired()?;

        if cmd.source.trim().is_empty() {
            return Err(DomainError::validation("source cannot be empty"));
        }

        // Variant match: value payload must fit the indicator's shape.
        match (&self.spec, &cmd.value) {
            (IndicatorSpec::Quantitative(_), MeasurementValue::Numeric { amount }) => {
                if !amount.is_finite() {
                    return Err(DomainError::validation("value must be finite"));
                }
            }
            (IndicatorSpec::Quantitative(_), MeasurementValue::Rating { .. }) => {
                return Err(DomainError::validation(
                    "quantitative indicator requires a numeric value",
                ));
            }
            (IndicatorSpec::Qualitative(spec), MeasurementValue::Rating { level, .. }) => {
                if !spec.scale.contains(level) {
                    return Err(DomainError::validation(format!(
                        "rating '{level}' is not a declared scale level"
                    )));
                }
            }
            (IndicatorSpec::Qualitative(_), MeasurementValue::Numeric { .. }) => {
                return Err(DomainError::validation(
                    "qualitative indicator requires a rating value",
                ));
            }
        }

        // Slices must reference declared pairs, once each.
        for (i, slice) in cmd.slices.iter().enumerate() {
            let declared = self
                .disaggregation
                .iter()
                .any(|c| c.name == slice.category && c.declares(&slice.subcategory));
            if !declared {
                return Err(DomainError::validation(format!(
                    "slice '{}/{}' is not declared in the disaggregation set",
                    slice.category, slice.subcategory
                )));
            }
            if !slice.value.is_finite() {
                return Err(DomainError::validation("slice value must be finite"));
            }
            if cmd.slices[..i]
                .iter()
                .any(|s| s.category == slice.category && s.subcategory == slice.subcategory)
            {
                return Err(DomainError::validation(format!(
                    "duplicate slice '{}/{}'",
                    slice.category, slice.subcategory
                )));
            }
        }

        // The current series is ordered by date.
        if cmd.kind == ValueKind::Current {
            if let Some(latest) = self.latest_current_date() {
                if cmd.measured_at <= latest {
                    return Err(DomainError::conflict(format!(
                        "current value must be dated after {latest}"
                    )));
                }
            }
        }

        Ok(vec![IndicatorEvent::ValueRecorded(ValueRecorded {
            tenant_id: cmd.tenant_id,
            indicator_id: cmd.indicator_id,
            kind: cmd.kind,
            value: cmd.value.clone(),
            measured_at: cmd.measured_at,
            source: cmd.source.clone(),
            slices: cmd.slices.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_retire(&self, cmd: &RetireIndicator) -> Result<Vec<IndicatorEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_indicator_id(cmd.indicator_id)?;

        if self.is_retired() {
            return Err(DomainError::conflict("indicator is already retired"));
        }

        Ok(vec![IndicatorEvent::IndicatorRetired(IndicatorRetired {
            tenant_id: cmd.tenant_id,
            indicator_id: cmd.indicator_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::AggregateId;
    use pulse_events::execute;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_indicator_id() -> IndicatorId {
        IndicatorId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn gender() -> DisaggregationCategory {
        DisaggregationCategory::new("gender", vec!["female".to_string(), "male".to_string()])
    }

    fn quantitative_spec() -> IndicatorSpec {
        IndicatorSpec::Quantitative(QuantitativeSpec {
            unit: "households".to_string(),
            baseline: Some(0.0),
            target: Some(500.0),
            calculation: CalculationMethod::Sum,
        })
    }

    fn qualitative_spec() -> IndicatorSpec {
        IndicatorSpec::Qualitative(QualitativeSpec {
            scale: RatingScale::new(vec![
                "poor".to_string(),
                "fair".to_string(),
                "good".to_string(),
            ]),
            narrative_template: None,
            assessment_criteria: vec!["community participation".to_string()],
        })
    }

    fn define_cmd(
        tenant_id: TenantId,
        indicator_id: IndicatorId,
        spec: IndicatorSpec,
    ) -> DefineIndicator {
        DefineIndicator {
            tenant_id,
            indicator_id,
            name: "Households reached".to_string(),
            description: "Cumulative households reached by the program".to_string(),
            frequency: ReportingFrequency::Monthly,
            disaggregation: vec![gender()],
            spec,
            occurred_at: test_time(),
        }
    }

    fn defined_indicator(spec: IndicatorSpec) -> (Indicator, TenantId, IndicatorId) {
        let tenant_id = test_tenant_id();
        let indicator_id = test_indicator_id();
        let mut indicator = Indicator::empty(indicator_id);
        execute(
            &mut indicator,
            &IndicatorCommand::DefineIndicator(define_cmd(tenant_id, indicator_id, spec)),
        )
        .unwrap();
        (indicator, tenant_id, indicator_id)
    }

    fn record_cmd(
        tenant_id: TenantId,
        indicator_id: IndicatorId,
        measured_at: NaiveDate,
        amount: f64,
    ) -> RecordValue {
        RecordValue {
            tenant_id,
            indicator_id,
            kind: ValueKind::Current,
            value: MeasurementValue::numeric(amount),
            measured_at,
            source: "field survey".to_string(),
            slices: vec![],
            occurred_at: test_time(),
        }
    }

    #[test]
    fn define_emits_indicator_defined_event() {
        let tenant_id = test_tenant_id();
        let indicator_id = test_indicator_id();
        let indicator = Indicator::empty(indicator_id);

        let events = indicator
            .handle(&IndicatorCommand::DefineIndicator(define_cmd(
                tenant_id,
                indicator_id,
                quantitative_spec(),
            )))
            .unwrap();
        assert_eq!(events.len(), 1);

        match &events[0] {
            IndicatorEvent::IndicatorDefined(e) => {
                assert_eq!(e.tenant_id, tenant_id);
                assert_eq!(e.indicator_id, indicator_id);
                assert_eq!(e.name, "Households reached");
                assert_eq!(e.spec.kind_name(), "quantitative");
            }
            _ => panic!("Expected IndicatorDefined event"),
        }
    }

    #[test]
    fn define_rejects_empty_name() {
        let indicator = Indicator::empty(test_indicator_id());
        let mut cmd = define_cmd(test_tenant_id(), test_indicator_id(), quantitative_spec());
        cmd.name = "   ".to_string();

        let err = indicator
            .handle(&IndicatorCommand::DefineIndicator(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn define_rejects_duplicate_creation() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let err = indicator
            .handle(&IndicatorCommand::DefineIndicator(define_cmd(
                tenant_id,
                indicator_id,
                quantitative_spec(),
            )))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn define_rejects_invalid_quantitative_spec() {
        let indicator = Indicator::empty(test_indicator_id());
        let mut cmd = define_cmd(test_tenant_id(), test_indicator_id(), quantitative_spec());
        if let IndicatorSpec::Quantitative(spec) = &mut cmd.spec {
            spec.unit = String::new();
        }
        assert!(
            indicator
                .handle(&IndicatorCommand::DefineIndicator(cmd))
                .is_err()
        );
    }

    #[test]
    fn define_rejects_broken_custom_formula() {
        let indicator = Indicator::empty(test_indicator_id());
        let mut cmd = define_cmd(test_tenant_id(), test_indicator_id(), quantitative_spec());
        if let IndicatorSpec::Quantitative(spec) = &mut cmd.spec {
            spec.calculation = CalculationMethod::Custom(crate::Formula {
                expression: "served /".to_string(),
                variables: vec![],
            });
        }
        let err = indicator
            .handle(&IndicatorCommand::DefineIndicator(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("formula")));
    }

    #[test]
    fn define_rejects_duplicate_disaggregation_category() {
        let indicator = Indicator::empty(test_indicator_id());
        let mut cmd = define_cmd(test_tenant_id(), test_indicator_id(), quantitative_spec());
        cmd.disaggregation = vec![gender(), gender()];
        assert!(
            indicator
                .handle(&IndicatorCommand::DefineIndicator(cmd))
                .is_err()
        );
    }

    #[test]
    fn record_appends_to_history() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());

        let events = execute(
            &mut indicator,
            &IndicatorCommand::RecordValue(record_cmd(
                tenant_id,
                indicator_id,
                date("2024-01-31"),
                120.0,
            )),
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(indicator.values().len(), 1);
        assert_eq!(indicator.values()[0].value.as_numeric(), Some(120.0));
    }

    #[test]
    fn record_rejects_rating_on_quantitative() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let mut cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 0.0);
        cmd.value = MeasurementValue::rating("good", None);

        let err = indicator
            .handle(&IndicatorCommand::RecordValue(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("numeric")));
    }

    #[test]
    fn record_rejects_numeric_on_qualitative() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(qualitative_spec());
        let cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 5.0);

        let err = indicator
            .handle(&IndicatorCommand::RecordValue(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("rating")));
    }

    #[test]
    fn record_rejects_undeclared_rating_level() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(qualitative_spec());
        let mut cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 0.0);
        cmd.value = MeasurementValue::rating("excellent", None);

        let err = indicator
            .handle(&IndicatorCommand::RecordValue(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("scale")));
    }

    #[test]
    fn record_accepts_declared_rating_with_narrative() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(qualitative_spec());
        let mut cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 0.0);
        cmd.value = MeasurementValue::rating("good", Some("strong engagement".to_string()));

        assert!(
            execute(&mut indicator, &IndicatorCommand::RecordValue(cmd)).is_ok()
        );
    }

    #[test]
    fn record_rejects_undeclared_slice() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let mut cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 100.0);
        cmd.slices = vec![DisaggregatedSlice {
            category: "age".to_string(),
            subcategory: "0-17".to_string(),
            value: 40.0,
        }];

        let err = indicator
            .handle(&IndicatorCommand::RecordValue(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("disaggregation")));
    }

    #[test]
    fn record_rejects_duplicate_slice_pair() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let mut cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 100.0);
        let slice = DisaggregatedSlice {
            category: "gender".to_string(),
            subcategory: "female".to_string(),
            value: 50.0,
        };
        cmd.slices = vec![slice.clone(), slice];

        let err = indicator
            .handle(&IndicatorCommand::RecordValue(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn record_accepts_declared_slices() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let mut cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 100.0);
        cmd.slices = vec![
            DisaggregatedSlice {
                category: "gender".to_string(),
                subcategory: "female".to_string(),
                value: 60.0,
            },
            DisaggregatedSlice {
                category: "gender".to_string(),
                subcategory: "male".to_string(),
                value: 40.0,
            },
        ];

        execute(&mut indicator, &IndicatorCommand::RecordValue(cmd)).unwrap();
        assert_eq!(indicator.values()[0].slices.len(), 2);
    }

    #[test]
    fn current_series_must_move_forward_in_time() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());

        execute(
            &mut indicator,
            &IndicatorCommand::RecordValue(record_cmd(
                tenant_id,
                indicator_id,
                date("2024-02-29"),
                100.0,
            )),
        )
        .unwrap();

        // Same date: rejected.
        let err = indicator
            .handle(&IndicatorCommand::RecordValue(record_cmd(
                tenant_id,
                indicator_id,
                date("2024-02-29"),
                110.0,
            )))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));

        // Earlier date: rejected.
        let err = indicator
            .handle(&IndicatorCommand::RecordValue(record_cmd(
                tenant_id,
                indicator_id,
                date("2024-01-31"),
                90.0,
            )))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));

        // Later date: accepted.
        assert!(
            indicator
                .handle(&IndicatorCommand::RecordValue(record_cmd(
                    tenant_id,
                    indicator_id,
                    date("2024-03-31"),
                    120.0,
                )))
                .is_ok()
        );
    }

    #[test]
    fn baseline_and_target_values_are_not_order_constrained() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());

        execute(
            &mut indicator,
            &IndicatorCommand::RecordValue(record_cmd(
                tenant_id,
                indicator_id,
                date("2024-02-29"),
                100.0,
            )),
        )
        .unwrap();

        // A baseline dated before the latest current value is fine.
        let mut cmd = record_cmd(tenant_id, indicator_id, date("2023-12-31"), 10.0);
        cmd.kind = ValueKind::Baseline;
        assert!(
            indicator
                .handle(&IndicatorCommand::RecordValue(cmd))
                .is_ok()
        );
    }

    #[test]
    fn record_rejects_empty_source() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let mut cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 10.0);
        cmd.source = "  ".to_string();
        assert!(
            indicator
                .handle(&IndicatorCommand::RecordValue(cmd))
                .is_err()
        );
    }

    #[test]
    fn record_rejects_non_finite_value() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), f64::NAN);
        assert!(
            indicator
                .handle(&IndicatorCommand::RecordValue(cmd))
                .is_err()
        );
    }

    #[test]
    fn record_rejects_unknown_indicator() {
        let indicator = Indicator::empty(test_indicator_id());
        let err = indicator
            .handle(&IndicatorCommand::RecordValue(record_cmd(
                test_tenant_id(),
                test_indicator_id(),
                date("2024-01-31"),
                1.0,
            )))
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[test]
    fn record_rejects_wrong_tenant() {
        let (indicator, _tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let err = indicator
            .handle(&IndicatorCommand::RecordValue(record_cmd(
                test_tenant_id(),
                indicator_id,
                date("2024-01-31"),
                1.0,
            )))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(msg) if msg.contains("tenant")));
    }

    #[test]
    fn revise_updates_only_provided_fields() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());

        execute(
            &mut indicator,
            &IndicatorCommand::ReviseIndicator(ReviseIndicator {
                tenant_id,
                indicator_id,
                name: Some("Households reached (rev)".to_string()),
                description: None,
                frequency: Some(ReportingFrequency::Quarterly),
                disaggregation: None,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(indicator.name(), "Households reached (rev)");
        assert_eq!(indicator.frequency(), ReportingFrequency::Quarterly);
        assert_eq!(
            indicator.description(),
            "Cumulative households reached by the program"
        );
        assert_eq!(indicator.disaggregation().len(), 1);
    }

    #[test]
    fn revise_rejects_empty_change_set() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let err = indicator
            .handle(&IndicatorCommand::ReviseIndicator(ReviseIndicator {
                tenant_id,
                indicator_id,
                name: None,
                description: None,
                frequency: None,
                disaggregation: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn revise_cannot_drop_referenced_disaggregation_pair() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());

        let mut cmd = record_cmd(tenant_id, indicator_id, date("2024-01-31"), 100.0);
        cmd.slices = vec![DisaggregatedSlice {
            category: "gender".to_string(),
            subcategory: "female".to_string(),
            value: 60.0,
        }];
        execute(&mut indicator, &IndicatorCommand::RecordValue(cmd)).unwrap();

        // Replacing the set with one that lacks gender/female must fail.
        let err = indicator
            .handle(&IndicatorCommand::ReviseIndicator(ReviseIndicator {
                tenant_id,
                indicator_id,
                name: None,
                description: None,
                frequency: None,
                disaggregation: Some(vec![DisaggregationCategory::new(
                    "gender",
                    vec!["male".to_string()],
                )]),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(msg) if msg.contains("female")));

        // Extending the set is fine.
        assert!(
            indicator
                .handle(&IndicatorCommand::ReviseIndicator(ReviseIndicator {
                    tenant_id,
                    indicator_id,
                    name: None,
                    description: None,
                    frequency: None,
                    disaggregation: Some(vec![
                        gender(),
                        DisaggregationCategory::new(
                            "age",
                            vec!["0-17".to_string(), "18+".to_string()],
                        ),
                    ]),
                    occurred_at: test_time(),
                }))
                .is_ok()
        );
    }

    #[test]
    fn retire_is_terminal() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());

        execute(
            &mut indicator,
            &IndicatorCommand::RetireIndicator(RetireIndicator {
                tenant_id,
                indicator_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(indicator.status(), IndicatorStatus::Retired);

        // No further values.
        let err = indicator
            .handle(&IndicatorCommand::RecordValue(record_cmd(
                tenant_id,
                indicator_id,
                date("2024-06-30"),
                1.0,
            )))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(msg) if msg.contains("retired")));

        // No double retire.
        let err = indicator
            .handle(&IndicatorCommand::RetireIndicator(RetireIndicator {
                tenant_id,
                indicator_id,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));

        // History is still readable.
        assert!(indicator.values().is_empty());
    }

    #[test]
    fn version_increments_on_apply() {
        let (mut indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        assert_eq!(indicator.version(), 1);

        execute(
            &mut indicator,
            &IndicatorCommand::RecordValue(record_cmd(
                tenant_id,
                indicator_id,
                date("2024-01-31"),
                10.0,
            )),
        )
        .unwrap();
        assert_eq!(indicator.version(), 2);

        execute(
            &mut indicator,
            &IndicatorCommand::RetireIndicator(RetireIndicator {
                tenant_id,
                indicator_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(indicator.version(), 3);
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let (indicator, tenant_id, indicator_id) = defined_indicator(quantitative_spec());
        let before = indicator.clone();

        let cmd = IndicatorCommand::RecordValue(record_cmd(
            tenant_id,
            indicator_id,
            date("2024-01-31"),
            10.0,
        ));
        let events1 = indicator.handle(&cmd).unwrap();
        let events2 = indicator.handle(&cmd).unwrap();

        assert_eq!(indicator, before);
        assert_eq!(events1, events2);
    }

    #[test]
    fn apply_is_deterministic() {
        let tenant_id = test_tenant_id();
        let indicator_id = test_indicator_id();
        let defined = IndicatorEvent::IndicatorDefined(IndicatorDefined {
            tenant_id,
            indicator_id,
            name: "Water points functional".to_string(),
            description: String::new(),
            frequency: ReportingFrequency::Quarterly,
            disaggregation: vec![],
            spec: quantitative_spec(),
            occurred_at: test_time(),
        });
        let recorded = IndicatorEvent::ValueRecorded(ValueRecorded {
            tenant_id,
            indicator_id,
            kind: ValueKind::Current,
            value: MeasurementValue::numeric(42.0),
            measured_at: date("2024-03-31"),
            source: "district report".to_string(),
            slices: vec![],
            occurred_at: test_time(),
        });
        let retired = IndicatorEvent::IndicatorRetired(IndicatorRetired {
            tenant_id,
            indicator_id,
            occurred_at: test_time(),
        });

        let mut a = Indicator::empty(indicator_id);
        let mut b = Indicator::empty(indicator_id);
        for ev in [&defined, &recorded, &retired] {
            a.apply(ev);
            b.apply(ev);
        }

        assert_eq!(a, b);
        assert_eq!(a.version(), 3);
        assert_eq!(a.status(), IndicatorStatus::Retired);
        assert_eq!(a.values().len(), 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Same state + command always decides the same events, without
            /// mutating state.
            #[test]
            fn handle_is_deterministic(
                name in "[A-Za-z][A-Za-z0-9 ]{0,60}",
                amount in -1.0e9f64..1.0e9f64,
            ) {
                let tenant_id = test_tenant_id();
                let indicator_id = test_indicator_id();
                let mut indicator = Indicator::empty(indicator_id);

                let mut define = define_cmd(tenant_id, indicator_id, quantitative_spec());
                define.name = name;
                execute(&mut indicator, &IndicatorCommand::DefineIndicator(define)).unwrap();

                let before = indicator.clone();
                let cmd = IndicatorCommand::RecordValue(record_cmd(
                    tenant_id,
                    indicator_id,
                    date("2024-01-31"),
                    amount,
                ));

                let events1 = indicator.handle(&cmd);
                let events2 = indicator.handle(&cmd);

                prop_assert_eq!(&indicator, &before);
                prop_assert_eq!(events1, events2);
            }

            /// Replaying the same events always lands on the same state.
            #[test]
            fn apply_is_deterministic(
                amounts in proptest::collection::vec(-1.0e9f64..1.0e9f64, 1..12),
            ) {
                let tenant_id = test_tenant_id();
                let indicator_id = test_indicator_id();

                let mut events = vec![IndicatorEvent::IndicatorDefined(IndicatorDefined {
                    tenant_id,
                    indicator_id,
                    name: "n".to_string(),
                    description: String::new(),
                    frequency: ReportingFrequency::Monthly,
                    disaggregation: vec![],
                    spec: quantitative_spec(),
                    occurred_at: test_time(),
                })];
                for (i, amount) in amounts.iter().enumerate() {
                    events.push(IndicatorEvent::ValueRecorded(ValueRecorded {
                        tenant_id,
                        indicator_id,
                        kind: ValueKind::Current,
                        value: MeasurementValue::numeric(*amount),
                        measured_at: NaiveDate::from_num_days_from_ce_opt(738000 + i as i32)
                            .unwrap(),
                        source: "s".to_string(),
                        slices: vec![],
                        occurred_at: test_time(),
                    }));
                }

                let mut a = Indicator::empty(indicator_id);
                let mut b = Indicator::empty(indicator_id);
                for ev in &events {
                    a.apply(ev);
                    b.apply(ev);
                }

                prop_assert_eq!(&a, &b);
                prop_assert_eq!(a.version(), events.len() as u64);
                prop_assert_eq!(a.values().len(), amounts.len());
            }

            /// Accepted current values always leave the series strictly
            /// ordered by measurement date.
            #[test]
            fn current_series_stays_ordered(
                day_offsets in proptest::collection::vec(0i64..3000, 1..24),
            ) {
                let tenant_id = test_tenant_id();
                let indicator_id = test_indicator_id();
                let mut indicator = Indicator::empty(indicator_id);
                execute(
                    &mut indicator,
                    &IndicatorCommand::DefineIndicator(define_cmd(
                        tenant_id,
                        indicator_id,
                        quantitative_spec(),
                    )),
                )
                .unwrap();

                let epoch = date("2020-01-01");
                for offset in day_offsets {
                    let cmd = IndicatorCommand::RecordValue(record_cmd(
                        tenant_id,
                        indicator_id,
                        epoch + chrono::Duration::days(offset),
                        1.0,
                    ));
                    // Out-of-order dates are rejected; accepted ones extend
                    // the series.
                    let _ = execute(&mut indicator, &cmd);
                }

                let dates: Vec<NaiveDate> =
                    indicator.current_series().map(|v| v.measured_at).collect();
                prop_assert!(dates.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
