//! Event Schema Validator (C1).
//!
//! Grounded on `original_source/apps/ml-service/app/schemas/behavioral_events.py`
//! (a Pandera `DataFrameModel`): per-column checks plus the
//! `experimentPhase -> contextMetadataId` cross-column implication, `strict`
//! column filtering, and type coercion.

use crate::models::event::{BehavioralEvent, CompletionQuality, EngagementLevel, EventType, RawEventRecord};
use crate::utils::EngineError;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// CUID-like identifier: a lowercase letter followed by 24 lowercase
/// alphanumerics, matching the upstream Prisma `id`/`userId` format.
static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^c[a-z0-9]{24}$").unwrap());

const MAX_AGE_DAYS: i64 = 5 * 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Fail on the first violating row; reject the whole batch.
    Strict,
    /// Accumulate every violation and return a structured report.
    Report,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationViolation {
    pub column: String,
    pub check: String,
    pub index: usize,
    pub failure_case: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    pub errors: Vec<ValidationViolation>,
}

pub struct EventValidator;

impl Default for EventValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventValidator {
    pub fn new() -> Self {
        Self
    }

    /// Strict mode: returns the coerced, filtered batch or the first
    /// violation encountered, as `InvalidData`/`ValidationError`.
    pub fn validate_strict(&self, rows: &[RawEventRecord]) -> Result<Vec<BehavioralEvent>, EngineError> {
        let mut out = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            match self.coerce_row(row, index) {
                Ok(event) => out.push(event),
                Err(violation) => {
                    return Err(EngineError::validation_error(format!(
                        "row {} column {} failed check {}: {}",
                        violation.index, violation.column, violation.check, violation.failure_case
                    )));
                },
            }
        }
        Ok(out)
    }

    /// Report mode: never short-circuits; accumulates every violation.
    pub fn validate_with_report(&self, rows: &[RawEventRecord]) -> (Vec<BehavioralEvent>, ValidationReport) {
        let mut valid = Vec::new();
        let mut errors = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            match self.coerce_row(row, index) {
                Ok(event) => valid.push(event),
                Err(violation) => errors.push(violation),
            }
        }

        let report = ValidationReport {
            total_rows: rows.len(),
            valid_rows: valid.len(),
            invalid_rows: rows.len() - valid.len(),
            errors,
        };
        (valid, report)
    }

    fn coerce_row(&self, row: &RawEventRecord, index: usize) -> Result<BehavioralEvent, ValidationViolation> {
        let violation = |column: &str, check: &str, failure_case: String| ValidationViolation {
            column: column.to_string(),
            check: check.to_string(),
            index,
            failure_case,
        };

        let id = row
            .id
            .as_deref()
            .filter(|v| ID_RE.is_match(v))
            .ok_or_else(|| violation("id", "str_matches", format!("{:?}", row.id)))?
            .to_string();

        let user_id = row
            .user_id
            .as_deref()
            .filter(|v| ID_RE.is_match(v))
            .ok_or_else(|| violation("userId", "str_matches", format!("{:?}", row.user_id)))?
            .to_string();

        let event_type = row
            .event_type
            .as_deref()
            .filter(|v| EventType::values().contains(v))
            .ok_or_else(|| violation("eventType", "isin", format!("{:?}", row.event_type)))?
            .to_string();

        let event_data = row
            .event_data
            .as_ref()
            .ok_or_else(|| violation("eventData", "not_nullable", "missing".to_string()))?
            .to_string();

        let timestamp: DateTime<Utc> = row
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| violation("timestamp", "coerce", format!("{:?}", row.timestamp)))?;

        let now = Utc::now();
        if timestamp > now {
            return Err(violation("timestamp", "timestamp_not_in_future", timestamp.to_rfc3339()));
        }
        if timestamp < now - Duration::days(MAX_AGE_DAYS) {
            return Err(violation("timestamp", "timestamp_reasonable", timestamp.to_rfc3339()));
        }

        let session_performance_score = match &row.session_performance_score {
            None => None,
            Some(v) => {
                let n = v
                    .as_i64()
                    .ok_or_else(|| violation("sessionPerformanceScore", "coerce", v.to_string()))?;
                if !(0..=100).contains(&n) {
                    return Err(violation(
                        "sessionPerformanceScore",
                        "in_range(0,100)",
                        n.to_string(),
                    ));
                }
                Some(n as i32)
            },
        };

        let completion_quality = match &row.completion_quality {
            None => None,
            Some(v) if CompletionQuality::values().contains(&v.as_str()) => Some(v.clone()),
            Some(v) => return Err(violation("completionQuality", "isin", v.clone())),
        };

        let engagement_level = match &row.engagement_level {
            None => None,
            Some(v) if EngagementLevel::values().contains(&v.as_str()) => Some(v.clone()),
            Some(v) => return Err(violation("engagementLevel", "isin", v.clone())),
        };

        let day_of_week = match &row.day_of_week {
            None => None,
            Some(v) => {
                let n = v.as_i64().ok_or_else(|| violation("dayOfWeek", "coerce", v.to_string()))?;
                if !(0..=6).contains(&n) {
                    return Err(violation("dayOfWeek", "in_range(0,6)", n.to_string()));
                }
                Some(n as i32)
            },
        };

        let time_of_day = match &row.time_of_day {
            None => None,
            Some(v) => {
                let n = v.as_i64().ok_or_else(|| violation("timeOfDay", "coerce", v.to_string()))?;
                if !(0..=23).contains(&n) {
                    return Err(violation("timeOfDay", "in_range(0,23)", n.to_string()));
                }
                Some(n as i32)
            },
        };

        let experiment_phase = match &row.experiment_phase {
            None => None,
            Some(v) if crate::models::event::EXPERIMENT_PHASES.contains(&v.as_str()) => Some(v.clone()),
            Some(v) => return Err(violation("experimentPhase", "isin", v.clone())),
        };

        let randomization_seed = match &row.randomization_seed {
            None => None,
            Some(v) => Some(
                v.as_i64()
                    .ok_or_else(|| violation("randomizationSeed", "coerce", v.to_string()))?,
            ),
        };

        let context_metadata_id = row.context_metadata_id.clone();

        if experiment_phase.is_some() && context_metadata_id.is_none() {
            return Err(violation(
                "contextMetadataId",
                "experiment_phase_validation",
                "experimentPhase present without contextMetadataId".to_string(),
            ));
        }

        Ok(BehavioralEvent {
            id,
            user_id,
            event_type,
            event_data,
            timestamp,
            session_performance_score,
            completion_quality,
            engagement_level,
            day_of_week,
            time_of_day,
            experiment_phase,
            randomization_seed,
            context_metadata_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_row() -> RawEventRecord {
        RawEventRecord {
            id: Some("c000000000000000000000001".to_string()),
            user_id: Some("c000000000000000000000002".to_string()),
            event_type: Some("SESSION_STARTED".to_string()),
            event_data: Some(serde_json::json!({"k": "v"})),
            timestamp: Some(Utc::now().to_rfc3339()),
            session_performance_score: Some(serde_json::json!(80)),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_well_formed_row() {
        let v = EventValidator::new();
        let rows = vec![valid_row()];
        let result = v.validate_strict(&rows);
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_future_timestamp() {
        let v = EventValidator::new();
        let mut row = valid_row();
        row.timestamp = Some((Utc::now() + Duration::days(1)).to_rfc3339());
        assert!(v.validate_strict(&[row]).is_err());
    }

    #[test]
    fn requires_context_metadata_id_when_phase_present() {
        let v = EventValidator::new();
        let mut row = valid_row();
        row.experiment_phase = Some("baseline_1".to_string());
        row.context_metadata_id = None;
        assert!(v.validate_strict(&[row]).is_err());
    }

    #[test]
    fn report_mode_never_short_circuits() {
        let v = EventValidator::new();
        let rows = vec![valid_row(), RawEventRecord::default()];
        let (valid, report) = v.validate_with_report(&rows);
        assert_eq!(valid.len(), 1);
        assert_eq!(report.total_rows, 2);
        assert_eq!(report.invalid_rows, 1);
    }

    #[test]
    fn validate_with_report_is_idempotent() {
        let v = EventValidator::new();
        let rows = vec![valid_row(), RawEventRecord::default()];
        let (_, r1) = v.validate_with_report(&rows);
        let (_, r2) = v.validate_with_report(&rows);
        assert_eq!(r1.total_rows, r2.total_rows);
        assert_eq!(r1.invalid_rows, r2.invalid_rows);
    }
}
