use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{MeisaiError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = MeisaiError;
    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|_| MeisaiError::validation(format!("invalid session id: '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportStatus::Pending => write!(f, "pending"),
            ImportStatus::Processing => write!(f, "processing"),
            ImportStatus::Completed => write!(f, "completed"),
            ImportStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ImportStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImportStatus::Pending),
            "processing" => Ok(ImportStatus::Processing),
            "completed" => Ok(ImportStatus::Completed),
            "failed" => Ok(ImportStatus::Failed),
            other => Err(format!("Unknown import status: '{other}'")),
        }
    }
}

/// How a single consumed row ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Success,
    Duplicate,
    Error,
}

/// Who an import belongs to and what it is called.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportSource {
    pub account_type: String,
    pub account_id: String,
    pub file_name: String,
}

/// One logical import, single-shot or streamed.
///
/// Counters only move through [`ImportSession::record`], which keeps
/// `success_rows + error_rows + duplicate_rows == processed_rows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
    pub session_id: SessionId,
    pub account_type: String,
    pub account_id: String,
    pub file_name: String,
    pub status: ImportStatus,
    /// Confirmed row count. Known upfront for whole-file imports, only after
    /// the final chunk for streams.
    pub total_rows: Option<u64>,
    /// Caller-supplied hint for streams; may be exceeded.
    pub estimated_rows: Option<u64>,
    pub processed_rows: u64,
    pub success_rows: u64,
    pub error_rows: u64,
    pub duplicate_rows: u64,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportSession {
    pub fn new(source: ImportSource) -> Self {
        ImportSession {
            session_id: SessionId::new(),
            account_type: source.account_type,
            account_id: source.account_id,
            file_name: source.file_name,
            status: ImportStatus::Pending,
            total_rows: None,
            estimated_rows: None,
            processed_rows: 0,
            success_rows: 0,
            error_rows: 0,
            duplicate_rows: 0,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending -> processing. Calling it again while processing is a no-op.
    pub fn start(&mut self) -> Result<()> {
        match self.status {
            ImportStatus::Pending => {
                self.status = ImportStatus::Processing;
                Ok(())
            }
            ImportStatus::Processing => Ok(()),
            other => Err(self.transition_error(other, ImportStatus::Processing)),
        }
    }

    pub fn confirm_total(&mut self, total: u64) -> Result<()> {
        if self.is_terminal() {
            return Err(MeisaiError::validation(format!(
                "session {} is already {}",
                self.session_id, self.status
            )));
        }
        if total < self.processed_rows {
            return Err(MeisaiError::validation(format!(
                "total_rows {total} is below processed_rows {}",
                self.processed_rows
            )));
        }
        self.total_rows = Some(total);
        Ok(())
    }

    pub fn record(&mut self, outcome: RowOutcome) -> Result<()> {
        if self.status != ImportStatus::Processing {
            return Err(MeisaiError::validation(format!(
                "session {} is {}, rows can only be recorded while processing",
                self.session_id, self.status
            )));
        }
        if let Some(total) = self.total_rows {
            if self.processed_rows >= total {
                return Err(MeisaiError::validation(format!(
                    "session {} already processed all {total} rows",
                    self.session_id
                )));
            }
        }
        self.processed_rows += 1;
        match outcome {
            RowOutcome::Success => self.success_rows += 1,
            RowOutcome::Duplicate => self.duplicate_rows += 1,
            RowOutcome::Error => self.error_rows += 1,
        }
        Ok(())
    }

    /// Terminal success. An empty import may complete straight from pending.
    pub fn complete(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Err(self.transition_error(self.status, ImportStatus::Completed));
        }
        let total = self.total_rows.unwrap_or(self.processed_rows);
        if self.processed_rows != total {
            return Err(MeisaiError::validation(format!(
                "session {} processed {} of {total} rows",
                self.session_id, self.processed_rows
            )));
        }
        self.total_rows = Some(total);
        self.status = ImportStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.is_terminal() {
            return Err(self.transition_error(self.status, ImportStatus::Failed));
        }
        self.status = ImportStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Fraction of processed rows that were errors; 0.0 before any row.
    pub fn error_rate(&self) -> f64 {
        if self.processed_rows == 0 {
            0.0
        } else {
            self.error_rows as f64 / self.processed_rows as f64
        }
    }

    pub fn progress(&self) -> ImportProgress {
        let total_rows = self.total_rows.or(self.estimated_rows).unwrap_or(0);
        let progress_percentage = match (self.status, self.total_rows, self.estimated_rows) {
            (ImportStatus::Completed, _, _) => 100.0,
            (_, Some(0), _) => 0.0,
            (_, Some(total), _) => self.processed_rows as f64 / total as f64 * 100.0,
            // An estimate can be overshot; never claim completion from one.
            (_, None, Some(est)) if est > 0 => {
                (self.processed_rows as f64 / est as f64 * 100.0).min(99.0)
            }
            _ => 0.0,
        };
        ImportProgress {
            session_id: self.session_id,
            status: self.status,
            processed_rows: self.processed_rows,
            total_rows,
            success_rows: self.success_rows,
            error_rows: self.error_rows,
            duplicate_rows: self.duplicate_rows,
            progress_percentage,
        }
    }

    fn transition_error(&self, from: ImportStatus, to: ImportStatus) -> MeisaiError {
        MeisaiError::InvalidTransition {
            entity: "import session",
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Point-in-time view of a session, as emitted on the progress queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportProgress {
    pub session_id: SessionId,
    pub status: ImportStatus,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub success_rows: u64,
    pub error_rows: u64,
    pub duplicate_rows: u64,
    pub progress_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ImportSession {
        ImportSession::new(ImportSource {
            account_type: "corporate".into(),
            account_id: "acct-1".into(),
            file_name: "meisai.csv".into(),
        })
    }

    fn assert_counters(s: &ImportSession) {
        assert_eq!(s.success_rows + s.error_rows + s.duplicate_rows, s.processed_rows);
        if let Some(total) = s.total_rows {
            assert!(s.processed_rows <= total);
        }
    }

    #[test]
    fn new_session_is_pending() {
        let s = session();
        assert_eq!(s.status, ImportStatus::Pending);
        assert_eq!(s.processed_rows, 0);
        assert!(s.completed_at.is_none());
    }

    #[test]
    fn rows_cannot_be_recorded_before_start() {
        let mut s = session();
        assert!(s.record(RowOutcome::Success).is_err());
        assert_eq!(s.processed_rows, 0);
    }

    #[test]
    fn counters_stay_consistent() {
        let mut s = session();
        s.confirm_total(4).unwrap();
        s.start().unwrap();
        for outcome in [
            RowOutcome::Success,
            RowOutcome::Duplicate,
            RowOutcome::Error,
            RowOutcome::Success,
        ] {
            s.record(outcome).unwrap();
            assert_counters(&s);
        }
        assert_eq!(s.success_rows, 2);
        assert_eq!(s.duplicate_rows, 1);
        assert_eq!(s.error_rows, 1);
    }

    #[test]
    fn cannot_exceed_confirmed_total() {
        let mut s = session();
        s.confirm_total(1).unwrap();
        s.start().unwrap();
        s.record(RowOutcome::Success).unwrap();
        assert!(s.record(RowOutcome::Success).is_err());
        assert_counters(&s);
    }

    #[test]
    fn estimate_may_be_exceeded() {
        let mut s = session();
        s.estimated_rows = Some(1);
        s.start().unwrap();
        s.record(RowOutcome::Success).unwrap();
        s.record(RowOutcome::Success).unwrap();
        let p = s.progress();
        assert_eq!(p.processed_rows, 2);
        assert_eq!(p.progress_percentage, 99.0);
    }

    #[test]
    fn confirm_total_below_processed_rejected() {
        let mut s = session();
        s.start().unwrap();
        s.record(RowOutcome::Success).unwrap();
        s.record(RowOutcome::Success).unwrap();
        assert!(s.confirm_total(1).is_err());
        assert_eq!(s.total_rows, None);
    }

    #[test]
    fn empty_import_completes_from_pending() {
        let mut s = session();
        s.confirm_total(0).unwrap();
        s.complete().unwrap();
        assert_eq!(s.status, ImportStatus::Completed);
        assert_eq!(s.total_rows, Some(0));
        assert_eq!(s.progress().progress_percentage, 100.0);
    }

    #[test]
    fn complete_requires_all_rows() {
        let mut s = session();
        s.confirm_total(2).unwrap();
        s.start().unwrap();
        s.record(RowOutcome::Success).unwrap();
        assert!(s.complete().is_err());
        assert_eq!(s.status, ImportStatus::Processing);
    }

    #[test]
    fn complete_without_total_confirms_processed() {
        let mut s = session();
        s.start().unwrap();
        s.record(RowOutcome::Success).unwrap();
        s.complete().unwrap();
        assert_eq!(s.total_rows, Some(1));
    }

    #[test]
    fn exactly_one_terminal_transition() {
        let mut s = session();
        s.start().unwrap();
        s.fail("cancelled").unwrap();
        assert!(s.complete().is_err());
        assert!(s.fail("again").is_err());
        assert!(s.start().is_err());
        assert_eq!(s.failure_reason.as_deref(), Some("cancelled"));
    }

    #[test]
    fn progress_with_confirmed_total() {
        let mut s = session();
        s.confirm_total(4).unwrap();
        s.start().unwrap();
        s.record(RowOutcome::Success).unwrap();
        let p = s.progress();
        assert_eq!(p.total_rows, 4);
        assert_eq!(p.progress_percentage, 25.0);
    }

    #[test]
    fn error_rate() {
        let mut s = session();
        assert_eq!(s.error_rate(), 0.0);
        s.start().unwrap();
        s.record(RowOutcome::Error).unwrap();
        s.record(RowOutcome::Success).unwrap();
        assert_eq!(s.error_rate(), 0.5);
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            ImportStatus::Pending,
            ImportStatus::Processing,
            ImportStatus::Completed,
            ImportStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ImportStatus>().unwrap(), status);
        }
    }

    #[test]
    fn session_id_parse() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
