use serde::Serialize;
use thiserror::Error;

use crate::mapping::MappingId;
use crate::record::RecordId;
use crate::session::SessionId;

pub type Result<T, E = MeisaiError> = std::result::Result<T, E>;

/// The closed set of failures surfaced by the ingestion and linking core.
///
/// Callers branch on the variant, never on the rendered message.
#[derive(Debug, Error)]
pub enum MeisaiError {
    #[error("row parse error: {0}")]
    RowParse(#[from] RowError),
    #[error("import session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("mapping not found: {0}")]
    MappingNotFound(MappingId),
    #[error("statement record not found: {0}")]
    RecordNotFound(RecordId),
    #[error(
        "statement record {statement_record_id} already has an active {entity_type} mapping ({active_mapping_id})"
    )]
    MappingConflict {
        statement_record_id: RecordId,
        entity_type: String,
        active_mapping_id: MappingId,
    },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("cannot move {entity} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl MeisaiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MeisaiError::Validation(msg.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        MeisaiError::Storage(err.to_string())
    }

    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            MeisaiError::RowParse(_) => "row_parse",
            MeisaiError::SessionNotFound(_) => "session_not_found",
            MeisaiError::MappingNotFound(_) => "mapping_not_found",
            MeisaiError::RecordNotFound(_) => "record_not_found",
            MeisaiError::MappingConflict { .. } => "mapping_conflict",
            MeisaiError::Validation(_) => "validation",
            MeisaiError::InvalidTransition { .. } => "invalid_transition",
            MeisaiError::Stream(_) => "stream",
            MeisaiError::Storage(_) => "storage",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MeisaiError::SessionNotFound(_)
                | MeisaiError::MappingNotFound(_)
                | MeisaiError::RecordNotFound(_)
        )
    }
}

/// A single CSV row that could not be turned into a statement record.
/// Row errors are counted against the session; they never stop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("line {line}: {kind}")]
pub struct RowError {
    /// 1-based physical row number in the source, header included.
    pub line: u64,
    pub kind: RowErrorKind,
}

impl RowError {
    pub fn new(line: u64, kind: RowErrorKind) -> Self {
        Self { line, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RowErrorKind {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("invalid time: {0}")]
    InvalidTime(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("toll amount must not be negative: {0}")]
    NegativeAmount(i64),
    #[error("row is not valid UTF-8")]
    Encoding,
    #[error("malformed CSV row: {0}")]
    Malformed(String),
    #[error("duplicate of an existing record")]
    Duplicate,
    #[error("conflicts with record {0} at the same date, time and card")]
    Conflict(RecordId),
    #[error("storage rejected the row: {0}")]
    Storage(String),
    /// An identical or same-key row is still being stored by another
    /// import. Resubmitting the row later resolves it.
    #[error("an identical row is still being stored; retry the row")]
    InFlight,
}

impl RowErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RowErrorKind::InFlight | RowErrorKind::Storage(_))
    }
}

/// Session-level failures: any of these moves the session to `failed`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("malformed header row: {0}")]
    MalformedHeader(String),
    #[error("chunk for session {got} delivered to session {expected}")]
    SessionMismatch { expected: SessionId, got: SessionId },
    #[error("chunk {got} out of order (expected {expected})")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("chunk {0} received after the final chunk")]
    AfterLast(u64),
    #[error("import cancelled")]
    Cancelled,
    #[error("chunk stream closed before the final chunk")]
    Aborted,
    #[error("row error rate {rate:.3} exceeds tolerance {max:.3}")]
    ErrorRateExceeded { rate: f64, max: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_are_distinct_from_validation() {
        assert!(MeisaiError::MappingNotFound(MappingId(4)).is_not_found());
        assert!(MeisaiError::RecordNotFound(RecordId(4)).is_not_found());
        assert!(!MeisaiError::validation("bad confidence").is_not_found());
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(MeisaiError::Stream(StreamError::Cancelled).kind(), "stream");
        assert_eq!(MeisaiError::storage("disk full").kind(), "storage");
    }

    #[test]
    fn row_error_display_includes_line() {
        let e = RowError::new(7, RowErrorKind::InvalidAmount("abc".into()));
        assert_eq!(e.to_string(), "line 7: invalid amount: abc");
    }

    #[test]
    fn row_error_serializes_with_kind_tag() {
        let e = RowError::new(3, RowErrorKind::MissingField("card_number"));
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["line"], 3);
        assert_eq!(json["kind"]["kind"], "missing_field");
        assert_eq!(json["kind"]["detail"], "card_number");
    }

    #[test]
    fn only_transient_row_errors_are_retryable() {
        assert!(RowErrorKind::InFlight.is_retryable());
        assert!(RowErrorKind::Storage("locked".into()).is_retryable());
        assert!(!RowErrorKind::Duplicate.is_retryable());
        assert!(!RowErrorKind::NegativeAmount(-1).is_retryable());
        let json = serde_json::to_value(RowErrorKind::InFlight).unwrap();
        assert_eq!(json["kind"], "in_flight");
    }
}
