use async_trait::async_trait;
use chrono::Utc;
use meisai_core::{
    MappingFilter, MappingId, MappingRecord, MappingRepository, MappingStatus, MeisaiError,
    NewMapping, RecordId, Result, StatementRecord, StatementRepository,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    records: BTreeMap<RecordId, StatementRecord>,
    by_hash: HashMap<String, RecordId>,
    next_record_id: i64,
    mappings: BTreeMap<MappingId, MappingRecord>,
    next_mapping_id: i64,
}

impl Tables {
    fn insert_record(&mut self, record: &StatementRecord) -> Result<RecordId> {
        if self.by_hash.contains_key(&record.content_hash) {
            return Err(MeisaiError::storage(format!(
                "content_hash {} already stored",
                record.content_hash
            )));
        }
        self.next_record_id += 1;
        let id = RecordId(self.next_record_id);
        let stored = record.clone().with_id(id);
        self.by_hash.insert(stored.content_hash.clone(), id);
        self.records.insert(id, stored);
        Ok(id)
    }

    fn active_conflict(&self, mapping: &MappingRecord) -> bool {
        mapping.status == MappingStatus::Active
            && self.mappings.values().any(|m| {
                m.id != mapping.id
                    && m.status == MappingStatus::Active
                    && m.statement_record_id == mapping.statement_record_id
                    && m.external_entity_type == mapping.external_entity_type
            })
    }
}

/// Process-local implementation of both repositories, enforcing the same
/// uniqueness rules as the SQLite schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_record_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_count(&self) -> usize {
        self.tables().records.len()
    }

    /// While set, every statement record write fails with a storage error.
    /// Reads and mapping writes are unaffected.
    pub fn fail_record_writes(&self, fail: bool) {
        self.fail_record_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_record_writes.load(Ordering::SeqCst) {
            return Err(MeisaiError::storage("record writes are failing"));
        }
        Ok(())
    }
}

#[async_trait]
impl StatementRepository for MemoryStore {
    async fn create_record(&self, record: &StatementRecord) -> Result<StatementRecord> {
        self.check_writable()?;
        let id = self.tables().insert_record(record)?;
        Ok(record.clone().with_id(id))
    }

    async fn get_record(&self, id: RecordId) -> Result<Option<StatementRecord>> {
        Ok(self.tables().records.get(&id).cloned())
    }

    async fn update_record(&self, record: &StatementRecord) -> Result<()> {
        self.check_writable()?;
        let id = record
            .id
            .ok_or_else(|| MeisaiError::validation("cannot update a record without an id"))?;
        let mut tables = self.tables();
        let old_hash = match tables.records.get(&id) {
            Some(old) => old.content_hash.clone(),
            None => return Err(MeisaiError::RecordNotFound(id)),
        };
        if old_hash != record.content_hash {
            if tables.by_hash.contains_key(&record.content_hash) {
                return Err(MeisaiError::storage(format!(
                    "content_hash {} already stored",
                    record.content_hash
                )));
            }
            tables.by_hash.remove(&old_hash);
            tables.by_hash.insert(record.content_hash.clone(), id);
        }
        tables.records.insert(id, record.clone());
        Ok(())
    }

    async fn delete_record(&self, id: RecordId) -> Result<bool> {
        let mut tables = self.tables();
        match tables.records.remove(&id) {
            Some(old) => {
                tables.by_hash.remove(&old.content_hash);
                tables.mappings.retain(|_, m| m.statement_record_id != id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn bulk_insert(&self, records: &[StatementRecord]) -> Result<Vec<RecordId>> {
        self.check_writable()?;
        let mut tables = self.tables();
        let mut seen = std::collections::HashSet::new();
        for r in records {
            if tables.by_hash.contains_key(&r.content_hash) || !seen.insert(&r.content_hash) {
                return Err(MeisaiError::storage(format!(
                    "content_hash {} already stored",
                    r.content_hash
                )));
            }
        }
        records
            .iter()
            .map(|r| tables.insert_record(r))
            .collect()
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<StatementRecord>> {
        let tables = self.tables();
        Ok(tables
            .by_hash
            .get(content_hash)
            .and_then(|id| tables.records.get(id))
            .cloned())
    }

    async fn check_duplicates_by_hash(&self, hashes: &[String]) -> Result<HashMap<String, bool>> {
        let tables = self.tables();
        Ok(hashes
            .iter()
            .map(|h| (h.clone(), tables.by_hash.contains_key(h)))
            .collect())
    }

    async fn list_records(&self) -> Result<Vec<StatementRecord>> {
        Ok(self.tables().records.values().cloned().collect())
    }
}

#[async_trait]
impl MappingRepository for MemoryStore {
    async fn insert_mapping(&self, mapping: &NewMapping) -> Result<MappingRecord> {
        let mut tables = self.tables();
        if !tables.records.contains_key(&mapping.statement_record_id) {
            return Err(MeisaiError::RecordNotFound(mapping.statement_record_id));
        }
        let id = MappingId(tables.next_mapping_id + 1);
        let record = mapping.clone().into_record(id, Utc::now());
        if tables.active_conflict(&record) {
            return Err(MeisaiError::storage(
                "an active mapping already exists for this record and entity type",
            ));
        }
        tables.next_mapping_id += 1;
        tables.mappings.insert(id, record.clone());
        Ok(record)
    }

    async fn get_mapping(&self, id: MappingId) -> Result<Option<MappingRecord>> {
        Ok(self.tables().mappings.get(&id).cloned())
    }

    async fn list_mappings(&self, filter: &MappingFilter) -> Result<Vec<MappingRecord>> {
        Ok(self
            .tables()
            .mappings
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    async fn update_mapping(&self, mapping: &MappingRecord) -> Result<()> {
        let mut tables = self.tables();
        if !tables.mappings.contains_key(&mapping.id) {
            return Err(MeisaiError::MappingNotFound(mapping.id));
        }
        if tables.active_conflict(mapping) {
            return Err(MeisaiError::storage(
                "an active mapping already exists for this record and entity type",
            ));
        }
        tables.mappings.insert(mapping.id, mapping.clone());
        Ok(())
    }

    async fn delete_mapping(&self, id: MappingId) -> Result<bool> {
        Ok(self.tables().mappings.remove(&id).is_some())
    }

    async fn find_active_mapping(
        &self,
        statement_record_id: RecordId,
        entity_type: &str,
    ) -> Result<Option<MappingRecord>> {
        Ok(self
            .tables()
            .mappings
            .values()
            .find(|m| {
                m.status == MappingStatus::Active
                    && m.statement_record_id == statement_record_id
                    && m.external_entity_type == entity_type
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use meisai_core::{MatchType, StatementFields};

    fn record(hash: &str) -> StatementRecord {
        StatementRecord::new(
            StatementFields {
                date: NaiveDate::from_ymd_opt(2025, 7, 30).unwrap(),
                time: NaiveTime::from_hms_opt(8, 15, 0).unwrap(),
                date_to: None,
                time_to: None,
                entry_point: "東京".into(),
                exit_point: "横浜町田".into(),
                toll_station_name: String::new(),
                toll_amount: 1200,
                usage_category: String::new(),
                vehicle_class: String::new(),
                vehicle_number: "品川 300 あ 12-34".into(),
                card_number: "1234".into(),
                remarks: String::new(),
            },
            hash.to_string(),
        )
    }

    #[tokio::test]
    async fn ids_are_assigned_in_order() {
        let store = MemoryStore::new();
        let a = store.create_record(&record("a")).await.unwrap();
        let b = store.create_record(&record("b")).await.unwrap();
        assert_eq!(a.id, Some(RecordId(1)));
        assert_eq!(b.id, Some(RecordId(2)));
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_hash_rejected() {
        let store = MemoryStore::new();
        store.create_record(&record("a")).await.unwrap();
        assert!(store.create_record(&record("a")).await.is_err());
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn failing_writes_leave_reads_working() {
        let store = MemoryStore::new();
        let stored = store.create_record(&record("a")).await.unwrap();
        store.fail_record_writes(true);
        assert!(matches!(
            store.create_record(&record("b")).await,
            Err(MeisaiError::Storage(_))
        ));
        assert!(store.update_record(&stored).await.is_err());
        assert!(store.get_by_hash("a").await.unwrap().is_some());
        store.fail_record_writes(false);
        store.create_record(&record("b")).await.unwrap();
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn bulk_insert_checks_before_writing() {
        let store = MemoryStore::new();
        let batch = [record("a"), record("b"), record("a")];
        assert!(store.bulk_insert(&batch).await.is_err());
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn delete_record_cascades_to_mappings() {
        let store = MemoryStore::new();
        let rec = store.create_record(&record("a")).await.unwrap();
        let id = rec.id.unwrap();
        store
            .insert_mapping(&NewMapping {
                statement_record_id: id,
                external_entity_id: "deal-1".into(),
                external_entity_type: "freee_deal".into(),
                confidence: Some(1.0),
                match_type: MatchType::Exact,
                status: MappingStatus::Pending,
                notes: None,
            })
            .await
            .unwrap();
        assert!(store.delete_record(id).await.unwrap());
        assert!(store
            .list_mappings(&MappingFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_enforces_single_active() {
        let store = MemoryStore::new();
        let rec = store.create_record(&record("a")).await.unwrap();
        let new = |entity: &str| NewMapping {
            statement_record_id: rec.id.unwrap(),
            external_entity_id: entity.into(),
            external_entity_type: "freee_deal".into(),
            confidence: None,
            match_type: MatchType::Manual,
            status: MappingStatus::Pending,
            notes: None,
        };
        let mut first = store.insert_mapping(&new("deal-1")).await.unwrap();
        let mut second = store.insert_mapping(&new("deal-2")).await.unwrap();
        first.status = MappingStatus::Active;
        store.update_mapping(&first).await.unwrap();
        second.status = MappingStatus::Active;
        assert!(store.update_mapping(&second).await.is_err());
    }
}
