use meisai_core::{
    MappingFilter, MappingId, MappingRecord, MappingRepository, MappingStatus, MappingUpdate,
    MeisaiError, NewMapping, RecordId, Result, StatementRepository,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::match_engine::{MatchCandidate, MatchEngine, ScoredMatch};

#[derive(Debug, Clone, Serialize)]
pub struct ProposalOutcome {
    /// Pending mappings created by this run, best first.
    pub created: Vec<MappingRecord>,
    /// Set when exactly one proposal cleared the auto-confirm threshold and
    /// was activated.
    pub auto_confirmed: Option<MappingId>,
}

/// Mapping administration and the record-linking workflow.
///
/// Every state change runs under one service-wide lock, so the
/// "one active mapping per record and entity type" check and the write that
/// depends on it cannot interleave with another transition.
pub struct LinkingService {
    mappings: Arc<dyn MappingRepository>,
    records: Arc<dyn StatementRepository>,
    engine: MatchEngine,
    auto_confirm_threshold: Option<f64>,
    lock: Mutex<()>,
}

impl LinkingService {
    pub fn new(
        mappings: Arc<dyn MappingRepository>,
        records: Arc<dyn StatementRepository>,
        engine: MatchEngine,
        auto_confirm_threshold: Option<f64>,
    ) -> Self {
        LinkingService {
            mappings,
            records,
            engine,
            auto_confirm_threshold,
            lock: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &MatchEngine {
        &self.engine
    }

    pub async fn create(&self, mapping: NewMapping) -> Result<MappingRecord> {
        let mapping = mapping.validate()?;
        let _guard = self.lock.lock().await;
        self.require_record(mapping.statement_record_id).await?;
        if mapping.status == MappingStatus::Active {
            self.ensure_no_other_active(
                mapping.statement_record_id,
                &mapping.external_entity_type,
                None,
            )
            .await?;
        }
        let created = self.mappings.insert_mapping(&mapping).await?;
        if created.status == MappingStatus::Active {
            if let Err(e) = self.sync_reference(created.statement_record_id, None).await {
                if let Err(undo) = self.mappings.delete_mapping(created.id).await {
                    tracing::warn!(mapping_id = %created.id, error = %undo, "failed to remove mapping");
                }
                return Err(e);
            }
        }
        tracing::info!(
            mapping_id = %created.id,
            record_id = %created.statement_record_id,
            match_type = %created.match_type,
            status = %created.status,
            "mapping created"
        );
        Ok(created)
    }

    pub async fn get(&self, id: MappingId) -> Result<MappingRecord> {
        self.mappings
            .get_mapping(id)
            .await?
            .ok_or(MeisaiError::MappingNotFound(id))
    }

    pub async fn list(&self, filter: &MappingFilter) -> Result<Vec<MappingRecord>> {
        self.mappings.list_mappings(filter).await
    }

    /// Applies an operator edit. A status change goes through the same
    /// transitions as the dedicated operations.
    pub async fn update(&self, id: MappingId, update: MappingUpdate) -> Result<MappingRecord> {
        let _guard = self.lock.lock().await;
        let mut mapping = self.get(id).await?;
        let before = mapping.clone();

        if let Some(raw) = update.confidence {
            mapping.set_confidence(raw)?;
        }
        if let Some(notes) = update.notes {
            mapping.notes = Some(notes);
            mapping.updated_at = chrono::Utc::now();
        }
        let activating = update.status == Some(MappingStatus::Active);
        if let Some(status) = update.status {
            if status != mapping.status {
                if activating {
                    self.ensure_no_other_active(
                        mapping.statement_record_id,
                        &mapping.external_entity_type,
                        Some(id),
                    )
                    .await?;
                }
                mapping.transition_to(status, update.rejection_reason.as_deref())?;
            }
        }

        self.persist(&before, &mapping).await?;
        Ok(mapping)
    }

    /// Returns `MappingNotFound` when nothing was stored under `id`. Deleting
    /// an active mapping re-points the record's external reference first.
    pub async fn delete(&self, id: MappingId) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mapping = self.get(id).await?;
        let was_active = mapping.status == MappingStatus::Active;
        if was_active {
            self.sync_reference(mapping.statement_record_id, Some(id)).await?;
        }
        let deleted = match self.mappings.delete_mapping(id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                if was_active {
                    self.resync(mapping.statement_record_id).await;
                }
                return Err(e);
            }
        };
        if !deleted {
            return Err(MeisaiError::MappingNotFound(id));
        }
        tracing::info!(mapping_id = %id, "mapping deleted");
        Ok(())
    }

    /// pending | inactive -> active. Fails with `MappingConflict`, leaving
    /// everything untouched, when another mapping for the same record and
    /// entity type is already active.
    pub async fn confirm(&self, id: MappingId) -> Result<MappingRecord> {
        let _guard = self.lock.lock().await;
        self.confirm_locked(id).await
    }

    pub async fn deactivate(&self, id: MappingId) -> Result<MappingRecord> {
        let _guard = self.lock.lock().await;
        let mut mapping = self.get(id).await?;
        let before = mapping.clone();
        mapping.deactivate()?;
        self.persist(&before, &mapping).await?;
        Ok(mapping)
    }

    pub async fn reject(&self, id: MappingId, reason: &str) -> Result<MappingRecord> {
        let _guard = self.lock.lock().await;
        let mut mapping = self.get(id).await?;
        let before = mapping.clone();
        mapping.reject(reason)?;
        self.persist(&before, &mapping).await?;
        Ok(mapping)
    }

    /// Scores candidates for a stored record without writing anything.
    pub async fn propose(&self, record_id: RecordId, candidates: &[MatchCandidate]) -> Result<Vec<ScoredMatch>> {
        validate_candidates(candidates)?;
        let record = self.require_record(record_id).await?;
        Ok(self.engine.propose(&record.fields, candidates))
    }

    /// Scores candidates and stores every proposal as a pending mapping.
    /// Candidates that already have a mapping for this record are skipped.
    /// With an auto-confirm threshold configured, a proposal is activated
    /// when it is the only one at or above that threshold.
    pub async fn propose_and_record(
        &self,
        record_id: RecordId,
        candidates: &[MatchCandidate],
    ) -> Result<ProposalOutcome> {
        validate_candidates(candidates)?;
        let record = self.require_record(record_id).await?;
        let scored = self.engine.propose(&record.fields, candidates);

        let _guard = self.lock.lock().await;
        let existing = self
            .mappings
            .list_mappings(&MappingFilter {
                statement_record_id: Some(record_id),
                ..Default::default()
            })
            .await?;

        let mut created = Vec::new();
        for m in scored {
            let known = existing.iter().any(|e| {
                e.external_entity_id == m.candidate_id && e.external_entity_type == m.entity_type
            });
            if known {
                continue;
            }
            let new = NewMapping {
                statement_record_id: record_id,
                external_entity_id: m.candidate_id,
                external_entity_type: m.entity_type,
                confidence: Some(m.confidence),
                match_type: m.match_type,
                status: MappingStatus::Pending,
                notes: None,
            }
            .validate()?;
            created.push(self.mappings.insert_mapping(&new).await?);
        }

        let mut auto_confirmed = None;
        if let Some(threshold) = self.auto_confirm_threshold {
            let mut eligible = created
                .iter()
                .filter(|m| m.confidence.is_some_and(|c| c >= threshold));
            if let (Some(only), None) = (eligible.next(), eligible.next()) {
                let id = only.id;
                match self.confirm_locked(id).await {
                    Ok(confirmed) => {
                        if let Some(slot) = created.iter_mut().find(|m| m.id == id) {
                            *slot = confirmed;
                        }
                        auto_confirmed = Some(id);
                    }
                    Err(MeisaiError::MappingConflict { .. }) => {
                        tracing::info!(mapping_id = %id, "auto-confirm skipped: record already linked");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::info!(
            record_id = %record_id,
            created = created.len(),
            auto_confirmed = ?auto_confirmed,
            "proposals recorded"
        );
        Ok(ProposalOutcome {
            created,
            auto_confirmed,
        })
    }

    async fn confirm_locked(&self, id: MappingId) -> Result<MappingRecord> {
        let mut mapping = self.get(id).await?;
        self.ensure_no_other_active(
            mapping.statement_record_id,
            &mapping.external_entity_type,
            Some(id),
        )
        .await?;
        let before = mapping.clone();
        mapping.confirm()?;
        self.persist(&before, &mapping).await?;
        tracing::info!(mapping_id = %id, record_id = %mapping.statement_record_id, "mapping confirmed");
        Ok(mapping)
    }

    /// Writes the mapping and, when it enters or leaves `active`, the
    /// record's external reference. A failed record write restores the
    /// previous mapping.
    async fn persist(&self, before: &MappingRecord, after: &MappingRecord) -> Result<()> {
        self.mappings.update_mapping(after).await?;
        let touches_link =
            before.status == MappingStatus::Active || after.status == MappingStatus::Active;
        if !touches_link {
            return Ok(());
        }
        if let Err(e) = self.sync_reference(after.statement_record_id, None).await {
            if let Err(restore) = self.mappings.update_mapping(before).await {
                tracing::warn!(mapping_id = %before.id, error = %restore, "failed to restore mapping");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Points the record's external reference at its most recently
    /// activated mapping, or clears it when none is active. `except` is left
    /// out of the choice.
    async fn sync_reference(&self, record_id: RecordId, except: Option<MappingId>) -> Result<()> {
        let active = self
            .mappings
            .list_mappings(&MappingFilter {
                statement_record_id: Some(record_id),
                status: Some(MappingStatus::Active),
                ..Default::default()
            })
            .await?;
        let reference = active
            .into_iter()
            .filter(|m| Some(m.id) != except)
            .max_by_key(|m| (m.updated_at, m.id))
            .map(|m| m.external_entity_id);

        let mut record = self.require_record(record_id).await?;
        if record.external_reference_number == reference {
            return Ok(());
        }
        tracing::debug!(record_id = %record_id, reference = ?reference, "external reference updated");
        record.external_reference_number = reference;
        self.records.update_record(&record).await
    }

    async fn resync(&self, record_id: RecordId) {
        if let Err(e) = self.sync_reference(record_id, None).await {
            tracing::warn!(record_id = %record_id, error = %e, "failed to restore external reference");
        }
    }

    async fn require_record(&self, id: RecordId) -> Result<meisai_core::StatementRecord> {
        self.records
            .get_record(id)
            .await?
            .ok_or(MeisaiError::RecordNotFound(id))
    }

    async fn ensure_no_other_active(
        &self,
        record_id: RecordId,
        entity_type: &str,
        except: Option<MappingId>,
    ) -> Result<()> {
        match self.mappings.find_active_mapping(record_id, entity_type).await? {
            Some(active) if Some(active.id) != except => Err(MeisaiError::MappingConflict {
                statement_record_id: record_id,
                entity_type: entity_type.to_string(),
                active_mapping_id: active.id,
            }),
            _ => Ok(()),
        }
    }
}

fn validate_candidates(candidates: &[MatchCandidate]) -> Result<()> {
    candidates.iter().try_for_each(MatchCandidate::validate)
}
