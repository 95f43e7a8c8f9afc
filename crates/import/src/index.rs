use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use meisai_core::{RecordId, StatementFields, StatementRecord};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The fingerprinted fields of a record, kept so a change at the same
/// natural key can be described field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSnapshot {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub entry_point: String,
    pub exit_point: String,
    pub toll_amount: i64,
    pub vehicle_number: String,
    pub card_number: String,
}

impl From<&StatementFields> for FieldSnapshot {
    fn from(f: &StatementFields) -> Self {
        FieldSnapshot {
            date: f.date,
            time: f.time,
            entry_point: f.entry_point.clone(),
            exit_point: f.exit_point.clone(),
            toll_amount: f.toll_amount,
            vehicle_number: f.vehicle_number.clone(),
            card_number: f.card_number.clone(),
        }
    }
}

impl FieldSnapshot {
    /// Names of the fields that differ between `self` and `other`.
    pub fn diff(&self, other: &FieldSnapshot) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.date != other.date {
            changed.push("date");
        }
        if self.time != other.time {
            changed.push("time");
        }
        if self.entry_point != other.entry_point {
            changed.push("entry_point");
        }
        if self.exit_point != other.exit_point {
            changed.push("exit_point");
        }
        if self.toll_amount != other.toll_amount {
            changed.push("toll_amount");
        }
        if self.vehicle_number != other.vehicle_number {
            changed.push("vehicle_number");
        }
        if self.card_number != other.card_number {
            changed.push("card_number");
        }
        changed
    }

    fn natural_key(&self) -> NaturalKey {
        (self.date, self.time, self.card_number.clone())
    }

    fn heap_size(&self) -> usize {
        self.entry_point.len() + self.exit_point.len() + self.vehicle_number.len() + self.card_number.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HashIndexEntry {
    pub content_hash: String,
    /// `None` while the fingerprint is claimed but the row is not yet stored.
    pub record_id: Option<RecordId>,
    pub last_seen_at: DateTime<Utc>,
    pub field_snapshot: FieldSnapshot,
}

/// Outcome of looking a fingerprint up in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Classification {
    New,
    Duplicate {
        record_id: Option<RecordId>,
    },
    /// Same date, time and card as a known record, different content.
    Changed {
        previous_hash: String,
        previous_record_id: Option<RecordId>,
        changed_fields: Vec<&'static str>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total_records: usize,
    pub pending_claims: usize,
    pub memory_estimate: usize,
    pub change_detection: bool,
}

type NaturalKey = (NaiveDate, NaiveTime, String);

#[derive(Default)]
struct Inner {
    by_hash: HashMap<String, HashIndexEntry>,
    by_key: HashMap<NaturalKey, String>,
}

impl Inner {
    fn lookup(&self, hash: &str, snapshot: &FieldSnapshot, detect_changes: bool) -> Classification {
        if let Some(entry) = self.by_hash.get(hash) {
            return Classification::Duplicate { record_id: entry.record_id };
        }
        if detect_changes {
            if let Some(previous) = self
                .by_key
                .get(&snapshot.natural_key())
                .and_then(|h| self.by_hash.get(h))
            {
                return Classification::Changed {
                    previous_hash: previous.content_hash.clone(),
                    previous_record_id: previous.record_id,
                    changed_fields: previous.field_snapshot.diff(snapshot),
                };
            }
        }
        Classification::New
    }

    fn put(&mut self, entry: HashIndexEntry, detect_changes: bool) {
        if detect_changes {
            self.by_key
                .insert(entry.field_snapshot.natural_key(), entry.content_hash.clone());
        }
        self.by_hash.insert(entry.content_hash.clone(), entry);
    }

    fn remove(&mut self, hash: &str) -> Option<HashIndexEntry> {
        let entry = self.by_hash.remove(hash)?;
        let key = entry.field_snapshot.natural_key();
        if self.by_key.get(&key).map(String::as_str) == Some(hash) {
            self.by_key.remove(&key);
        }
        Some(entry)
    }
}

/// In-memory fingerprint index shared by every import session.
///
/// `classify` is a check-and-claim under one write lock: of two concurrent
/// callers presenting the same fingerprint exactly one sees `New`. A claim
/// is either committed with the stored record id or released when the row
/// could not be stored.
pub struct HashIndex {
    inner: RwLock<Inner>,
    detect_changes: bool,
}

impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HashIndex {
    pub fn new() -> Self {
        Self::with_change_detection(false)
    }

    /// With change detection on, a second natural-key index on
    /// (date, time, card number) reports rows whose content moved.
    pub fn with_change_detection(detect_changes: bool) -> Self {
        HashIndex {
            inner: RwLock::new(Inner::default()),
            detect_changes,
        }
    }

    pub fn detects_changes(&self) -> bool {
        self.detect_changes
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Classifies `hash` and, for `New` and `Changed`, claims it so that
    /// concurrent callers see a duplicate until the claim is released.
    pub fn classify(&self, hash: &str, fields: &StatementFields) -> Classification {
        let snapshot = FieldSnapshot::from(fields);
        let mut inner = self.write();
        let decision = inner.lookup(hash, &snapshot, self.detect_changes);
        match &decision {
            Classification::Duplicate { .. } => {
                if let Some(entry) = inner.by_hash.get_mut(hash) {
                    entry.last_seen_at = Utc::now();
                }
            }
            Classification::New => {
                inner.put(
                    HashIndexEntry {
                        content_hash: hash.to_string(),
                        record_id: None,
                        last_seen_at: Utc::now(),
                        field_snapshot: snapshot,
                    },
                    self.detect_changes,
                );
            }
            // The natural key keeps pointing at the previous hash until commit.
            Classification::Changed { .. } => {
                inner.by_hash.insert(
                    hash.to_string(),
                    HashIndexEntry {
                        content_hash: hash.to_string(),
                        record_id: None,
                        last_seen_at: Utc::now(),
                        field_snapshot: snapshot,
                    },
                );
            }
        }
        decision
    }

    /// Same decision as [`HashIndex::classify`] without claiming anything.
    pub fn peek(&self, hash: &str, fields: &StatementFields) -> Classification {
        self.read()
            .lookup(hash, &FieldSnapshot::from(fields), self.detect_changes)
    }

    /// Binds a claimed fingerprint to its stored record. If the claim
    /// replaced a previous version at the same natural key, that version's
    /// entry is dropped.
    pub fn commit(&self, hash: &str, record_id: RecordId) {
        let mut inner = self.write();
        let Some(entry) = inner.by_hash.get_mut(hash) else {
            return;
        };
        entry.record_id = Some(record_id);
        entry.last_seen_at = Utc::now();
        if !self.detect_changes {
            return;
        }
        let key = entry.field_snapshot.natural_key();
        if let Some(previous) = inner.by_key.insert(key, hash.to_string()) {
            if previous != hash {
                inner.by_hash.remove(&previous);
            }
        }
    }

    /// Drops a claim whose row was not stored.
    pub fn release(&self, hash: &str) {
        let mut inner = self.write();
        if inner.by_hash.get(hash).is_some_and(|e| e.record_id.is_none()) {
            inner.remove(hash);
        }
    }

    /// Registers an already stored record.
    pub fn insert(&self, record_id: RecordId, hash: &str, fields: &StatementFields) {
        let entry = HashIndexEntry {
            content_hash: hash.to_string(),
            record_id: Some(record_id),
            last_seen_at: Utc::now(),
            field_snapshot: FieldSnapshot::from(fields),
        };
        self.write().put(entry, self.detect_changes);
    }

    /// Rebuilds the index contents from stored records. Returns the number
    /// of entries registered.
    pub fn warm(&self, records: &[StatementRecord]) -> usize {
        let mut inner = self.write();
        let mut count = 0;
        for record in records {
            let Some(id) = record.id else { continue };
            inner.put(
                HashIndexEntry {
                    content_hash: record.content_hash.clone(),
                    record_id: Some(id),
                    last_seen_at: Utc::now(),
                    field_snapshot: FieldSnapshot::from(&record.fields),
                },
                self.detect_changes,
            );
            count += 1;
        }
        tracing::info!(entries = count, "hash index warmed");
        count
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.read().by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<HashIndexEntry> {
        self.read().by_hash.get(hash).cloned()
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.read();
        let pending_claims = inner.by_hash.values().filter(|e| e.record_id.is_none()).count();
        let entries: usize = inner
            .by_hash
            .values()
            .map(|e| {
                std::mem::size_of::<HashIndexEntry>() + e.content_hash.len() + e.field_snapshot.heap_size()
            })
            .sum();
        let keys: usize = inner
            .by_key
            .iter()
            .map(|(k, h)| std::mem::size_of::<NaturalKey>() + k.2.len() + h.len())
            .sum();
        IndexStats {
            total_records: inner.by_hash.len() - pending_claims,
            pending_claims,
            memory_estimate: entries + keys,
            change_detection: self.detect_changes,
        }
    }

    /// Removes every entry. Holds the write lock throughout, so no
    /// classification interleaves with the reset.
    pub fn clear(&self) -> usize {
        let mut inner = self.write();
        let removed = inner.by_hash.len();
        inner.by_hash.clear();
        inner.by_key.clear();
        tracing::warn!(removed, "hash index cleared");
        removed
    }
}
