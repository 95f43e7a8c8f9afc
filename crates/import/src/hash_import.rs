use meisai_core::{MeisaiError, Result, RowError, RowErrorKind, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::chunk::{Chunk, ChunkReassembler, MismatchPolicy};
use crate::csv;
use crate::hash::fingerprint;
use crate::index::{Classification, IndexStats};
use crate::pipeline::{IngestPipeline, RowDecision};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Count duplicates silently. When off they are reported as row errors.
    pub skip_duplicates: bool,
    /// Overwrite records whose content changed at the same date, time and
    /// card. Needs change detection on the index.
    pub update_existing: bool,
    /// Classify every row without writing to storage or the index. Rows
    /// repeated within the file count as duplicates, as in a real run.
    pub validate_only: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            skip_duplicates: true,
            update_existing: false,
            validate_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HashImportReport {
    pub added_count: u64,
    pub updated_count: u64,
    pub duplicate_count: u64,
    pub error_count: u64,
    pub errors: Vec<RowError>,
}

impl HashImportReport {
    fn error(&mut self, err: RowError) {
        self.error_count += 1;
        self.errors.push(err);
    }

    fn duplicate(&mut self, line: u64, options: &ImportOptions) {
        if options.skip_duplicates {
            self.duplicate_count += 1;
        } else {
            self.error(RowError::new(line, RowErrorKind::Duplicate));
        }
    }
}

/// Administrative operations on the hash index: bulk loads from a
/// statement file outside any import session, statistics and reset.
#[derive(Clone)]
pub struct HashIndexAdmin {
    pipeline: IngestPipeline,
}

impl HashIndexAdmin {
    pub fn new(pipeline: IngestPipeline) -> Self {
        Self { pipeline }
    }

    pub async fn import(&self, csv_path: &Path, options: ImportOptions) -> Result<HashImportReport> {
        let data = tokio::fs::read(csv_path).await.map_err(|e| {
            MeisaiError::validation(format!("cannot read {}: {e}", csv_path.display()))
        })?;
        tracing::info!(path = %csv_path.display(), bytes = data.len(), ?options, "hash index import");
        self.import_bytes(data, options).await
    }

    pub async fn import_bytes(&self, data: Vec<u8>, options: ImportOptions) -> Result<HashImportReport> {
        let session_id = SessionId::new();
        let rows = ChunkReassembler::new(session_id, MismatchPolicy::Reject)
            .push(Chunk {
                session_id,
                chunk_number: 0,
                data,
                is_last: true,
            })?
            .unwrap_or_default();

        let mut report = HashImportReport::default();
        let mut dry_run_seen = HashSet::new();
        let mut line = 0u64;
        let mut header_seen = false;
        for row in rows {
            if row.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            line += 1;
            if !header_seen {
                header_seen = true;
                csv::check_header(&row)?;
                continue;
            }
            if options.validate_only {
                self.validate_row(&row, line, &options, &mut dry_run_seen, &mut report);
                continue;
            }
            match self.pipeline.apply_row(&row, line, options.update_existing).await {
                RowDecision::Added(_) => report.added_count += 1,
                RowDecision::Updated(_) => report.updated_count += 1,
                RowDecision::Duplicate => report.duplicate(line, &options),
                RowDecision::Failed(err) => report.error(err),
            }
        }

        tracing::info!(
            added = report.added_count,
            updated = report.updated_count,
            duplicates = report.duplicate_count,
            errors = report.error_count,
            validate_only = options.validate_only,
            "hash index import finished"
        );
        Ok(report)
    }

    /// Dry-run classification. `seen` holds fingerprints earlier rows would
    /// have claimed.
    fn validate_row(
        &self,
        row: &[u8],
        line: u64,
        options: &ImportOptions,
        seen: &mut HashSet<String>,
        report: &mut HashImportReport,
    ) {
        let fields = match csv::parse_row(row, line) {
            Ok(fields) => fields,
            Err(e) => return report.error(e),
        };
        let hash = fingerprint(&fields);
        if seen.contains(&hash) {
            return report.duplicate(line, options);
        }
        let decision = self.pipeline.index().peek(&hash, &fields);
        if !matches!(decision, Classification::Duplicate { .. }) {
            seen.insert(hash);
        }
        match decision {
            Classification::New => report.added_count += 1,
            Classification::Duplicate { .. } => report.duplicate(line, options),
            Classification::Changed {
                previous_record_id: Some(_),
                ..
            } if options.update_existing => report.updated_count += 1,
            Classification::Changed {
                previous_record_id, ..
            } => report.error(RowError::new(
                line,
                match previous_record_id {
                    Some(id) => RowErrorKind::Conflict(id),
                    None => RowErrorKind::InFlight,
                },
            )),
        }
    }

    pub fn stats(&self) -> IndexStats {
        self.pipeline.index().stats()
    }

    /// Empties the index. Stored records are untouched.
    pub fn clear(&self) -> usize {
        self.pipeline.index().clear()
    }
}
