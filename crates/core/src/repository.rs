//! Storage collaborator interfaces. The ingestion and linking code only ever
//! talks to persistence through these traits.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::mapping::{MappingFilter, MappingId, MappingRecord, NewMapping};
use crate::record::{RecordId, StatementRecord};

#[async_trait]
pub trait StatementRepository: Send + Sync {
    /// Persists a record and returns it with its assigned id.
    async fn create_record(&self, record: &StatementRecord) -> Result<StatementRecord>;
    async fn get_record(&self, id: RecordId) -> Result<Option<StatementRecord>>;
    /// Overwrites the stored record with the same id.
    async fn update_record(&self, record: &StatementRecord) -> Result<()>;
    /// Returns `false` when nothing was stored under `id`.
    async fn delete_record(&self, id: RecordId) -> Result<bool>;
    /// All-or-nothing insert of many records.
    async fn bulk_insert(&self, records: &[StatementRecord]) -> Result<Vec<RecordId>>;
    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<StatementRecord>>;
    /// Every requested hash appears in the result, mapped to whether a record
    /// with that hash is stored.
    async fn check_duplicates_by_hash(&self, hashes: &[String]) -> Result<HashMap<String, bool>>;
    /// Every stored record, in id order. Used to warm the hash index.
    async fn list_records(&self) -> Result<Vec<StatementRecord>>;
}

#[async_trait]
pub trait MappingRepository: Send + Sync {
    /// `mapping` is expected to be validated already.
    async fn insert_mapping(&self, mapping: &NewMapping) -> Result<MappingRecord>;
    async fn get_mapping(&self, id: MappingId) -> Result<Option<MappingRecord>>;
    async fn list_mappings(&self, filter: &MappingFilter) -> Result<Vec<MappingRecord>>;
    async fn update_mapping(&self, mapping: &MappingRecord) -> Result<()>;
    async fn delete_mapping(&self, id: MappingId) -> Result<bool>;
    async fn find_active_mapping(
        &self,
        statement_record_id: RecordId,
        entity_type: &str,
    ) -> Result<Option<MappingRecord>>;
}
