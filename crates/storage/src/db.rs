use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use meisai_core::{
    MappingFilter, MappingId, MappingRecord, MappingRepository, MappingStatus, MatchType,
    MeisaiError, NewMapping, RecordId, StatementFields, StatementRecord, StatementRepository,
};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{query::Query, Pool, QueryBuilder, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub type DbPool = Pool<Sqlite>;

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StorageError> for MeisaiError {
    fn from(e: StorageError) -> Self {
        MeisaiError::storage(e)
    }
}

/// Opens (creating if needed) the SQLite database at `path` and runs migrations.
pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    open_pool(options).await
}

/// Accepts `sqlite::memory:`, a `sqlite:` URL, or a bare file path.
pub async fn connect(url: &str) -> Result<DbPool, sqlx::Error> {
    tracing::info!(url, "opening statement database");
    if url.starts_with("sqlite:") {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        open_pool(options).await
    } else {
        create_db(Path::new(url)).await
    }
}

async fn open_pool(options: SqliteConnectOptions) -> Result<DbPool, sqlx::Error> {
    // One connection: an in-memory database lives and dies with it.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;
    tracing::debug!("statement database migrations applied");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS statement_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            time TEXT NOT NULL,
            date_to TEXT,
            time_to TEXT,
            entry_point TEXT NOT NULL,
            exit_point TEXT NOT NULL,
            toll_station_name TEXT NOT NULL DEFAULT '',
            toll_amount INTEGER NOT NULL CHECK (toll_amount >= 0),
            usage_category TEXT NOT NULL DEFAULT '',
            vehicle_class TEXT NOT NULL DEFAULT '',
            vehicle_number TEXT NOT NULL,
            card_number TEXT NOT NULL,
            remarks TEXT NOT NULL DEFAULT '',
            content_hash TEXT NOT NULL UNIQUE,
            external_reference_number TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mapping_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            statement_record_id INTEGER NOT NULL,
            external_entity_id TEXT NOT NULL,
            external_entity_type TEXT NOT NULL,
            confidence REAL,
            match_type TEXT NOT NULL,
            status TEXT NOT NULL,
            rejection_reason TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (statement_record_id) REFERENCES statement_records(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one active mapping per (record, entity type).
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS mapping_records_one_active
        ON mapping_records (statement_record_id, external_entity_type)
        WHERE status = 'active'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

const RECORD_COLUMNS: &str = "id, date, time, date_to, time_to, entry_point, exit_point, \
     toll_station_name, toll_amount, usage_category, vehicle_class, vehicle_number, \
     card_number, remarks, content_hash, external_reference_number";

const INSERT_RECORD: &str = "INSERT INTO statement_records (date, time, date_to, time_to, \
     entry_point, exit_point, toll_station_name, toll_amount, usage_category, vehicle_class, \
     vehicle_number, card_number, remarks, content_hash, external_reference_number) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id";

const UPDATE_RECORD: &str = "UPDATE statement_records SET date = ?, time = ?, date_to = ?, \
     time_to = ?, entry_point = ?, exit_point = ?, toll_station_name = ?, toll_amount = ?, \
     usage_category = ?, vehicle_class = ?, vehicle_number = ?, card_number = ?, remarks = ?, \
     content_hash = ?, external_reference_number = ? WHERE id = ?";

const MAPPING_COLUMNS: &str = "id, statement_record_id, external_entity_id, \
     external_entity_type, confidence, match_type, status, rejection_reason, notes, \
     created_at, updated_at";

/// Binds every persisted column of `r`, in `INSERT_RECORD` order.
fn bind_record<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    r: &'q StatementRecord,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let f = &r.fields;
    query
        .bind(f.date.format(DATE_FMT).to_string())
        .bind(f.time.format(TIME_FMT).to_string())
        .bind(f.date_to.map(|d| d.format(DATE_FMT).to_string()))
        .bind(f.time_to.map(|t| t.format(TIME_FMT).to_string()))
        .bind(f.entry_point.as_str())
        .bind(f.exit_point.as_str())
        .bind(f.toll_station_name.as_str())
        .bind(f.toll_amount)
        .bind(f.usage_category.as_str())
        .bind(f.vehicle_class.as_str())
        .bind(f.vehicle_number.as_str())
        .bind(f.card_number.as_str())
        .bind(f.remarks.as_str())
        .bind(r.content_hash.as_str())
        .bind(r.external_reference_number.as_deref())
}

fn parse_date(s: &str) -> Result<NaiveDate, StorageError> {
    NaiveDate::parse_from_str(s, DATE_FMT)
        .map_err(|e| StorageError::Corrupt(format!("date '{s}': {e}")))
}

fn parse_time(s: &str) -> Result<NaiveTime, StorageError> {
    NaiveTime::parse_from_str(s, TIME_FMT)
        .map_err(|e| StorageError::Corrupt(format!("time '{s}': {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp '{s}': {e}")))
}

fn record_from_row(row: &SqliteRow) -> Result<StatementRecord, StorageError> {
    let date_to: Option<String> = row.try_get("date_to")?;
    let time_to: Option<String> = row.try_get("time_to")?;
    let fields = StatementFields {
        date: parse_date(&row.try_get::<String, _>("date")?)?,
        time: parse_time(&row.try_get::<String, _>("time")?)?,
        date_to: date_to.as_deref().map(parse_date).transpose()?,
        time_to: time_to.as_deref().map(parse_time).transpose()?,
        entry_point: row.try_get("entry_point")?,
        exit_point: row.try_get("exit_point")?,
        toll_station_name: row.try_get("toll_station_name")?,
        toll_amount: row.try_get("toll_amount")?,
        usage_category: row.try_get("usage_category")?,
        vehicle_class: row.try_get("vehicle_class")?,
        vehicle_number: row.try_get("vehicle_number")?,
        card_number: row.try_get("card_number")?,
        remarks: row.try_get("remarks")?,
    };
    Ok(StatementRecord {
        id: Some(RecordId(row.try_get("id")?)),
        fields,
        content_hash: row.try_get("content_hash")?,
        external_reference_number: row.try_get("external_reference_number")?,
    })
}

fn mapping_from_row(row: &SqliteRow) -> Result<MappingRecord, StorageError> {
    let match_type: String = row.try_get("match_type")?;
    let status: String = row.try_get("status")?;
    Ok(MappingRecord {
        id: MappingId(row.try_get("id")?),
        statement_record_id: RecordId(row.try_get("statement_record_id")?),
        external_entity_id: row.try_get("external_entity_id")?,
        external_entity_type: row.try_get("external_entity_type")?,
        confidence: row.try_get("confidence")?,
        match_type: MatchType::from_str(&match_type).map_err(StorageError::Corrupt)?,
        status: MappingStatus::from_str(&status).map_err(StorageError::Corrupt)?,
        rejection_reason: row.try_get("rejection_reason")?,
        notes: row.try_get("notes")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

/// SQLite-backed implementation of both repositories.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(connect(url).await?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn fetch_record(&self, id: RecordId) -> Result<Option<StatementRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM statement_records WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn fetch_mapping(&self, id: MappingId) -> Result<Option<MappingRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM mapping_records WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }
}

#[async_trait]
impl StatementRepository for SqliteStore {
    async fn create_record(&self, record: &StatementRecord) -> meisai_core::Result<StatementRecord> {
        let row = bind_record(sqlx::query(INSERT_RECORD), record)
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::from)?;
        let id = RecordId(row.try_get("id").map_err(StorageError::from)?);
        Ok(record.clone().with_id(id))
    }

    async fn get_record(&self, id: RecordId) -> meisai_core::Result<Option<StatementRecord>> {
        Ok(self.fetch_record(id).await?)
    }

    async fn update_record(&self, record: &StatementRecord) -> meisai_core::Result<()> {
        let id = record
            .id
            .ok_or_else(|| MeisaiError::validation("cannot update a record without an id"))?;
        let result = bind_record(sqlx::query(UPDATE_RECORD), record)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            return Err(MeisaiError::RecordNotFound(id));
        }
        Ok(())
    }

    async fn delete_record(&self, id: RecordId) -> meisai_core::Result<bool> {
        let result = sqlx::query("DELETE FROM statement_records WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_insert(&self, records: &[StatementRecord]) -> meisai_core::Result<Vec<RecordId>> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let row = bind_record(sqlx::query(INSERT_RECORD), record)
                .fetch_one(&mut *tx)
                .await
                .map_err(StorageError::from)?;
            ids.push(RecordId(row.try_get("id").map_err(StorageError::from)?));
        }
        tx.commit().await.map_err(StorageError::from)?;
        Ok(ids)
    }

    async fn get_by_hash(&self, content_hash: &str) -> meisai_core::Result<Option<StatementRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM statement_records WHERE content_hash = ?"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn check_duplicates_by_hash(
        &self,
        hashes: &[String],
    ) -> meisai_core::Result<HashMap<String, bool>> {
        let mut found = HashMap::with_capacity(hashes.len());
        for hash in hashes {
            let exists = sqlx::query("SELECT 1 FROM statement_records WHERE content_hash = ?")
                .bind(hash.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::from)?
                .is_some();
            found.insert(hash.clone(), exists);
        }
        Ok(found)
    }

    async fn list_records(&self) -> meisai_core::Result<Vec<StatementRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM statement_records ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl MappingRepository for SqliteStore {
    async fn insert_mapping(&self, mapping: &NewMapping) -> meisai_core::Result<MappingRecord> {
        if self.fetch_record(mapping.statement_record_id).await?.is_none() {
            return Err(MeisaiError::RecordNotFound(mapping.statement_record_id));
        }
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO mapping_records (statement_record_id, external_entity_id, \
             external_entity_type, confidence, match_type, status, notes, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(mapping.statement_record_id.0)
        .bind(mapping.external_entity_id.as_str())
        .bind(mapping.external_entity_type.as_str())
        .bind(mapping.confidence)
        .bind(mapping.match_type.to_string())
        .bind(mapping.status.to_string())
        .bind(mapping.notes.as_deref())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::from)?;
        let id = MappingId(row.try_get("id").map_err(StorageError::from)?);
        Ok(mapping.clone().into_record(id, now))
    }

    async fn get_mapping(&self, id: MappingId) -> meisai_core::Result<Option<MappingRecord>> {
        Ok(self.fetch_mapping(id).await?)
    }

    async fn list_mappings(&self, filter: &MappingFilter) -> meisai_core::Result<Vec<MappingRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {MAPPING_COLUMNS} FROM mapping_records WHERE 1 = 1"
        ));
        if let Some(id) = filter.statement_record_id {
            qb.push(" AND statement_record_id = ").push_bind(id.0);
        }
        if let Some(t) = filter.match_type {
            qb.push(" AND match_type = ").push_bind(t.to_string());
        }
        if let Some(s) = filter.status {
            qb.push(" AND status = ").push_bind(s.to_string());
        }
        if let Some(t) = &filter.entity_type {
            qb.push(" AND external_entity_type = ").push_bind(t.clone());
        }
        qb.push(" ORDER BY id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(rows
            .iter()
            .map(mapping_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn update_mapping(&self, mapping: &MappingRecord) -> meisai_core::Result<()> {
        let result = sqlx::query(
            "UPDATE mapping_records SET external_entity_id = ?, external_entity_type = ?, \
             confidence = ?, match_type = ?, status = ?, rejection_reason = ?, notes = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(mapping.external_entity_id.as_str())
        .bind(mapping.external_entity_type.as_str())
        .bind(mapping.confidence)
        .bind(mapping.match_type.to_string())
        .bind(mapping.status.to_string())
        .bind(mapping.rejection_reason.as_deref())
        .bind(mapping.notes.as_deref())
        .bind(mapping.updated_at.to_rfc3339())
        .bind(mapping.id.0)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            return Err(MeisaiError::MappingNotFound(mapping.id));
        }
        Ok(())
    }

    async fn delete_mapping(&self, id: MappingId) -> meisai_core::Result<bool> {
        let result = sqlx::query("DELETE FROM mapping_records WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_active_mapping(
        &self,
        statement_record_id: RecordId,
        entity_type: &str,
    ) -> meisai_core::Result<Option<MappingRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM mapping_records \
             WHERE statement_record_id = ? AND external_entity_type = ? AND status = 'active'"
        ))
        .bind(statement_record_id.0)
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(row.as_ref().map(mapping_from_row).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(amount: i64) -> StatementFields {
        StatementFields {
            date: NaiveDate::from_ymd_opt(2025, 7, 30).unwrap(),
            time: NaiveTime::from_hms_opt(8, 15, 0).unwrap(),
            date_to: Some(NaiveDate::from_ymd_opt(2025, 7, 30).unwrap()),
            time_to: Some(NaiveTime::from_hms_opt(8, 52, 0).unwrap()),
            entry_point: "東京".into(),
            exit_point: "横浜町田".into(),
            toll_station_name: String::new(),
            toll_amount: amount,
            usage_category: "ETC".into(),
            vehicle_class: "普通".into(),
            vehicle_number: "品川 300 あ 12-34".into(),
            card_number: "1234-5678-9012-3456".into(),
            remarks: String::new(),
        }
    }

    fn record(amount: i64, hash: &str) -> StatementRecord {
        StatementRecord::new(fields(amount), hash.to_string())
    }

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("meisai.db")).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn mapping(record_id: RecordId, entity: &str, status: MappingStatus) -> NewMapping {
        NewMapping {
            statement_record_id: record_id,
            external_entity_id: entity.into(),
            external_entity_type: "freee_deal".into(),
            confidence: None,
            match_type: MatchType::Manual,
            status,
            notes: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let (_dir, store) = store().await;
        let created = store.create_record(&record(1200, "h1")).await.unwrap();
        let id = created.id.unwrap();
        let fetched = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.fields.time_to, NaiveTime::from_hms_opt(8, 52, 0));
    }

    #[tokio::test]
    async fn duplicate_hash_rejected_by_unique_index() {
        let (_dir, store) = store().await;
        store.create_record(&record(1200, "h1")).await.unwrap();
        let err = store.create_record(&record(1200, "h1")).await.unwrap_err();
        assert!(matches!(err, MeisaiError::Storage(_)));
    }

    #[tokio::test]
    async fn get_by_hash_and_check_duplicates() {
        let (_dir, store) = store().await;
        store.create_record(&record(1200, "h1")).await.unwrap();
        assert!(store.get_by_hash("h1").await.unwrap().is_some());
        assert!(store.get_by_hash("h2").await.unwrap().is_none());

        let found = store
            .check_duplicates_by_hash(&["h1".to_string(), "h2".to_string()])
            .await
            .unwrap();
        assert_eq!(found.get("h1"), Some(&true));
        assert_eq!(found.get("h2"), Some(&false));
    }

    #[tokio::test]
    async fn bulk_insert_is_all_or_nothing() {
        let (_dir, store) = store().await;
        let batch = vec![record(100, "a"), record(200, "b"), record(300, "a")];
        assert!(store.bulk_insert(&batch).await.is_err());
        assert!(store.list_records().await.unwrap().is_empty());

        let ids = store
            .bulk_insert(&[record(100, "a"), record(200, "b")])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.list_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_sets_external_reference() {
        let (_dir, store) = store().await;
        let mut rec = store.create_record(&record(1200, "h1")).await.unwrap();
        rec.external_reference_number = Some("deal-42".into());
        store.update_record(&rec).await.unwrap();
        let fetched = store.get_record(rec.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(fetched.external_reference_number.as_deref(), Some("deal-42"));
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let (_dir, store) = store().await;
        let rec = record(1200, "h1").with_id(RecordId(99));
        assert!(matches!(
            store.update_record(&rec).await,
            Err(MeisaiError::RecordNotFound(RecordId(99)))
        ));
    }

    #[tokio::test]
    async fn delete_record_reports_presence() {
        let (_dir, store) = store().await;
        let rec = store.create_record(&record(1200, "h1")).await.unwrap();
        assert!(store.delete_record(rec.id.unwrap()).await.unwrap());
        assert!(!store.delete_record(rec.id.unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn mapping_insert_requires_record() {
        let (_dir, store) = store().await;
        let err = store
            .insert_mapping(&mapping(RecordId(5), "deal-1", MappingStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, MeisaiError::RecordNotFound(RecordId(5))));
    }

    #[tokio::test]
    async fn mapping_list_filters_and_find_active() {
        let (_dir, store) = store().await;
        let rec = store.create_record(&record(1200, "h1")).await.unwrap();
        let id = rec.id.unwrap();
        store
            .insert_mapping(&mapping(id, "deal-1", MappingStatus::Active))
            .await
            .unwrap();
        store
            .insert_mapping(&mapping(id, "deal-2", MappingStatus::Pending))
            .await
            .unwrap();

        let all = store.list_mappings(&MappingFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let pending = store
            .list_mappings(&MappingFilter {
                status: Some(MappingStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].external_entity_id, "deal-2");

        let active = store
            .find_active_mapping(id, "freee_deal")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.external_entity_id, "deal-1");
    }

    #[tokio::test]
    async fn second_active_mapping_rejected_by_index() {
        let (_dir, store) = store().await;
        let rec = store.create_record(&record(1200, "h1")).await.unwrap();
        let id = rec.id.unwrap();
        store
            .insert_mapping(&mapping(id, "deal-1", MappingStatus::Active))
            .await
            .unwrap();
        let mut second = store
            .insert_mapping(&mapping(id, "deal-2", MappingStatus::Pending))
            .await
            .unwrap();
        second.status = MappingStatus::Active;
        assert!(store.update_mapping(&second).await.is_err());
        let stored = store.get_mapping(second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MappingStatus::Pending);
    }

    #[tokio::test]
    async fn in_memory_url_connects() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.create_record(&record(1200, "h1")).await.unwrap();
        assert_eq!(store.list_records().await.unwrap().len(), 1);
    }
}
