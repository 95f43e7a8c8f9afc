use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MeisaiError, Result};
use crate::record::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingId(pub i64);

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Time,
    Amount,
    Manual,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchType::Exact => write!(f, "exact"),
            MatchType::Fuzzy => write!(f, "fuzzy"),
            MatchType::Time => write!(f, "time"),
            MatchType::Amount => write!(f, "amount"),
            MatchType::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for MatchType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(MatchType::Exact),
            "fuzzy" => Ok(MatchType::Fuzzy),
            "time" => Ok(MatchType::Time),
            "amount" => Ok(MatchType::Amount),
            "manual" => Ok(MatchType::Manual),
            other => Err(format!("Unknown match type: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    #[default]
    Pending,
    Active,
    Inactive,
    Rejected,
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingStatus::Pending => write!(f, "pending"),
            MappingStatus::Active => write!(f, "active"),
            MappingStatus::Inactive => write!(f, "inactive"),
            MappingStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for MappingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MappingStatus::Pending),
            "active" => Ok(MappingStatus::Active),
            "inactive" => Ok(MappingStatus::Inactive),
            "rejected" => Ok(MappingStatus::Rejected),
            other => Err(format!("Unknown mapping status: '{other}'")),
        }
    }
}

/// Maps a raw confidence onto [0, 1]. Values in (1, 100] are read as
/// percentages.
pub fn normalize_confidence(raw: f64) -> Result<f64> {
    if !raw.is_finite() || raw < 0.0 || raw > 100.0 {
        return Err(MeisaiError::validation(format!(
            "confidence {raw} is outside [0, 1] and [0, 100]"
        )));
    }
    Ok(if raw > 1.0 { raw / 100.0 } else { raw })
}

/// A link between a statement record and a record in an external
/// accounting system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub id: MappingId,
    pub statement_record_id: RecordId,
    pub external_entity_id: String,
    pub external_entity_type: String,
    /// Always in [0, 1]. Optional only for manual mappings.
    pub confidence: Option<f64>,
    pub match_type: MatchType,
    pub status: MappingStatus,
    pub rejection_reason: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MappingRecord {
    /// pending | inactive -> active. Exclusivity against other mappings is the
    /// caller's check; this only guards the record's own state.
    pub fn confirm(&mut self) -> Result<()> {
        match self.status {
            MappingStatus::Pending | MappingStatus::Inactive => {
                self.move_to(MappingStatus::Active);
                Ok(())
            }
            from => Err(transition_error(from, MappingStatus::Active)),
        }
    }

    pub fn deactivate(&mut self) -> Result<()> {
        match self.status {
            MappingStatus::Active => {
                self.move_to(MappingStatus::Inactive);
                Ok(())
            }
            from => Err(transition_error(from, MappingStatus::Inactive)),
        }
    }

    pub fn reject(&mut self, reason: &str) -> Result<()> {
        if self.status == MappingStatus::Rejected {
            return Err(transition_error(self.status, MappingStatus::Rejected));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MeisaiError::validation("rejection requires a reason"));
        }
        self.rejection_reason = Some(reason.to_string());
        self.move_to(MappingStatus::Rejected);
        Ok(())
    }

    /// Applies a requested target status through the allowed transitions.
    pub fn transition_to(&mut self, target: MappingStatus, reason: Option<&str>) -> Result<()> {
        match target {
            MappingStatus::Active => self.confirm(),
            MappingStatus::Inactive => self.deactivate(),
            MappingStatus::Rejected => self.reject(reason.unwrap_or_default()),
            MappingStatus::Pending => Err(transition_error(self.status, MappingStatus::Pending)),
        }
    }

    pub fn set_confidence(&mut self, raw: f64) -> Result<()> {
        if self.status == MappingStatus::Rejected {
            return Err(MeisaiError::validation(format!(
                "mapping {} is rejected and can no longer change",
                self.id
            )));
        }
        self.confidence = Some(normalize_confidence(raw)?);
        self.updated_at = Utc::now();
        Ok(())
    }

    fn move_to(&mut self, status: MappingStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

fn transition_error(from: MappingStatus, to: MappingStatus) -> MeisaiError {
    MeisaiError::InvalidTransition {
        entity: "mapping",
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// A mapping as requested by the match engine or an operator, before it has
/// an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMapping {
    pub statement_record_id: RecordId,
    pub external_entity_id: String,
    pub external_entity_type: String,
    pub confidence: Option<f64>,
    pub match_type: MatchType,
    #[serde(default)]
    pub status: MappingStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewMapping {
    /// Checks field presence, confidence range and the allowed initial
    /// status, returning the mapping with its confidence normalised.
    pub fn validate(mut self) -> Result<NewMapping> {
        self.external_entity_id = self.external_entity_id.trim().to_string();
        self.external_entity_type = self.external_entity_type.trim().to_string();
        if self.external_entity_id.is_empty() {
            return Err(MeisaiError::validation("external_entity_id is required"));
        }
        if self.external_entity_type.is_empty() {
            return Err(MeisaiError::validation("external_entity_type is required"));
        }

        self.confidence = match (self.confidence, self.match_type) {
            (Some(raw), _) => Some(normalize_confidence(raw)?),
            (None, MatchType::Manual) => None,
            (None, other) => {
                return Err(MeisaiError::validation(format!(
                    "confidence is required for {other} mappings"
                )))
            }
        };

        match (self.status, self.match_type) {
            (MappingStatus::Pending, _) => {}
            (MappingStatus::Active, MatchType::Manual) => {}
            (status, match_type) => {
                return Err(MeisaiError::validation(format!(
                    "a {match_type} mapping cannot be created as {status}"
                )))
            }
        }
        Ok(self)
    }

    pub fn into_record(self, id: MappingId, now: DateTime<Utc>) -> MappingRecord {
        MappingRecord {
            id,
            statement_record_id: self.statement_record_id,
            external_entity_id: self.external_entity_id,
            external_entity_type: self.external_entity_type,
            confidence: self.confidence,
            match_type: self.match_type,
            status: self.status,
            rejection_reason: None,
            notes: self.notes,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Operator edit of an existing mapping. `None` fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingUpdate {
    pub confidence: Option<f64>,
    pub status: Option<MappingStatus>,
    pub rejection_reason: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingFilter {
    pub statement_record_id: Option<RecordId>,
    pub match_type: Option<MatchType>,
    pub status: Option<MappingStatus>,
    pub entity_type: Option<String>,
}

impl MappingFilter {
    pub fn matches(&self, m: &MappingRecord) -> bool {
        self.statement_record_id
            .map_or(true, |id| id == m.statement_record_id)
            && self.match_type.map_or(true, |t| t == m.match_type)
            && self.status.map_or(true, |s| s == m.status)
            && self
                .entity_type
                .as_deref()
                .map_or(true, |t| t == m.external_entity_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_mapping(match_type: MatchType, confidence: Option<f64>) -> NewMapping {
        NewMapping {
            statement_record_id: RecordId(1),
            external_entity_id: "deal-42".into(),
            external_entity_type: "freee_deal".into(),
            confidence,
            match_type,
            status: MappingStatus::Pending,
            notes: None,
        }
    }

    fn record(status: MappingStatus) -> MappingRecord {
        let mut m = new_mapping(MatchType::Exact, Some(1.0))
            .validate()
            .unwrap()
            .into_record(MappingId(1), Utc::now());
        m.status = status;
        m
    }

    #[test]
    fn confidence_percentages_normalised() {
        assert_eq!(normalize_confidence(0.5).unwrap(), 0.5);
        assert_eq!(normalize_confidence(1.0).unwrap(), 1.0);
        assert_eq!(normalize_confidence(87.5).unwrap(), 0.875);
        assert!(normalize_confidence(-0.1).is_err());
        assert!(normalize_confidence(100.5).is_err());
        assert!(normalize_confidence(f64::NAN).is_err());
    }

    #[test]
    fn non_manual_requires_confidence() {
        assert!(new_mapping(MatchType::Fuzzy, None).validate().is_err());
        assert!(new_mapping(MatchType::Manual, None).validate().is_ok());
    }

    #[test]
    fn blank_entity_fields_rejected() {
        let mut m = new_mapping(MatchType::Exact, Some(1.0));
        m.external_entity_id = "  ".into();
        assert!(matches!(m.validate(), Err(MeisaiError::Validation(_))));
    }

    #[test]
    fn only_manual_may_start_active() {
        let mut m = new_mapping(MatchType::Manual, None);
        m.status = MappingStatus::Active;
        assert!(m.validate().is_ok());

        let mut m = new_mapping(MatchType::Exact, Some(1.0));
        m.status = MappingStatus::Active;
        assert!(m.validate().is_err());

        let mut m = new_mapping(MatchType::Manual, None);
        m.status = MappingStatus::Rejected;
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_normalises_confidence() {
        let m = new_mapping(MatchType::Amount, Some(90.0)).validate().unwrap();
        assert_eq!(m.confidence, Some(0.9));
    }

    #[test]
    fn confirm_from_pending_and_inactive() {
        let mut m = record(MappingStatus::Pending);
        m.confirm().unwrap();
        assert_eq!(m.status, MappingStatus::Active);
        m.deactivate().unwrap();
        assert_eq!(m.status, MappingStatus::Inactive);
        m.confirm().unwrap();
        assert_eq!(m.status, MappingStatus::Active);
    }

    #[test]
    fn deactivate_requires_active() {
        let mut m = record(MappingStatus::Pending);
        assert!(matches!(
            m.deactivate(),
            Err(MeisaiError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reject_requires_reason_and_is_terminal() {
        let mut m = record(MappingStatus::Active);
        assert!(m.reject("   ").is_err());
        assert_eq!(m.status, MappingStatus::Active);

        m.reject("wrong vehicle").unwrap();
        assert_eq!(m.status, MappingStatus::Rejected);
        assert_eq!(m.rejection_reason.as_deref(), Some("wrong vehicle"));

        assert!(m.confirm().is_err());
        assert!(m.deactivate().is_err());
        assert!(m.reject("again").is_err());
        assert!(m.set_confidence(0.5).is_err());
    }

    #[test]
    fn transition_to_pending_is_never_allowed() {
        let mut m = record(MappingStatus::Inactive);
        assert!(m.transition_to(MappingStatus::Pending, None).is_err());
    }

    #[test]
    fn filter_matches_all_set_fields() {
        let m = record(MappingStatus::Pending);
        assert!(MappingFilter::default().matches(&m));
        let f = MappingFilter {
            statement_record_id: Some(RecordId(1)),
            entity_type: Some("freee_deal".into()),
            ..Default::default()
        };
        assert!(f.matches(&m));
        let f = MappingFilter {
            status: Some(MappingStatus::Active),
            ..Default::default()
        };
        assert!(!f.matches(&m));
    }

    #[test]
    fn enums_roundtrip_through_strings() {
        for t in [
            MatchType::Exact,
            MatchType::Fuzzy,
            MatchType::Time,
            MatchType::Amount,
            MatchType::Manual,
        ] {
            assert_eq!(t.to_string().parse::<MatchType>().unwrap(), t);
        }
        assert_eq!("ACTIVE".parse::<MappingStatus>().unwrap(), MappingStatus::Active);
    }
}
