//! In-memory CRM store backed by a JSON snapshot.
//!
//! Used by the command-line importer against a local snapshot file and by the
//! test suite as the store double. Every write is appended to a write log so
//! callers can assert on ordering (for example that a flush preceded an insert).

use super::{AffiliationModel, CrmError, CrmPort, CrmQuery};
use crate::models::{CrmRecord, EntityKind, fields};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Serializable store contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySnapshot {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub records: Vec<CrmRecord>,
}

/// Kind of write recorded in the write log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    BatchInsert,
    BatchUpdate,
    Flush,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEvent {
    pub op: WriteOp,
    pub kind: Option<EntityKind>,
    pub id: Option<String>,
}

enum QueuedWrite {
    Insert(CrmRecord),
    Update(CrmRecord),
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<EntityKind, Vec<CrmRecord>>,
    next_id: u64,
    queue: Vec<QueuedWrite>,
    write_log: Vec<WriteEvent>,
    fail_flushes: bool,
    fail_lookups: bool,
}

impl MemoryState {
    fn mint_id(&mut self, kind: EntityKind) -> String {
        self.next_id += 1;
        format!("{}{:012}AAA", kind.id_prefix(), self.next_id)
    }

    fn apply_insert(&mut self, record: &CrmRecord) -> String {
        let id = self.mint_id(record.kind);
        let mut stored = record.clone();
        stored.id = Some(id.clone());
        stored.account = None;
        for field in std::mem::take(&mut stored.fields_to_null) {
            stored.fields.remove(&field);
        }
        if stored.created_at.is_none() {
            // Keep creation order strictly increasing within one store.
            stored.created_at = Some(Utc::now() + Duration::milliseconds(self.next_id as i64));
        }
        self.records.entry(record.kind).or_default().push(stored);
        id
    }

    fn apply_update(&mut self, record: &CrmRecord) -> Result<(), CrmError> {
        let id = record.id.as_deref().unwrap_or_default();
        let stored = self
            .records
            .get_mut(&record.kind)
            .and_then(|records| records.iter_mut().find(|r| id_matches(r, id)))
            .ok_or_else(|| CrmError::NotFound {
                kind: record.kind,
                id: id.to_string(),
            })?;

        stored.fields.merge(&record.fields);
        for field in &record.fields_to_null {
            stored.fields.remove(field);
        }
        Ok(())
    }

    fn of_kind(&self, kind: EntityKind) -> &[CrmRecord] {
        self.records.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Attach the parent account snapshot to contacts.
    fn hydrate(&self, record: &CrmRecord) -> CrmRecord {
        let mut record = record.clone();
        if record.kind == EntityKind::Contact {
            record.account = record
                .account_id()
                .and_then(|account_id| {
                    self.of_kind(EntityKind::Account)
                        .iter()
                        .find(|a| id_matches(a, account_id))
                })
                .map(|account| Box::new(account.clone()));
        }
        record
    }

    fn check_lookup(&self, kind: EntityKind) -> Result<(), CrmError> {
        if self.fail_lookups {
            return Err(CrmError::Lookup {
                kind,
                message: "store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn id_matches(record: &CrmRecord, candidate: &str) -> bool {
    match record.id.as_deref() {
        Some(id) if id == candidate => true,
        Some(id) if candidate.len() == 15 && id.len() == 18 => id.starts_with(candidate),
        _ => false,
    }
}

/// In-memory implementation of [`CrmPort`].
pub struct InMemoryCrm {
    state: Mutex<MemoryState>,
    model: AffiliationModel,
}

impl InMemoryCrm {
    pub fn new(model: AffiliationModel) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            model,
        }
    }

    pub fn from_snapshot(snapshot: MemorySnapshot, model: AffiliationModel) -> Self {
        let mut state = MemoryState {
            next_id: snapshot.next_id,
            ..Default::default()
        };
        for record in snapshot.records {
            state.records.entry(record.kind).or_default().push(record);
        }
        Self {
            state: Mutex::new(state),
            model,
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let state = self.state.lock();
        MemorySnapshot {
            next_id: state.next_id,
            records: state.records.values().flatten().cloned().collect(),
        }
    }

    /// Insert a record directly, bypassing the write log. Returns the new id.
    pub fn seed(&self, record: CrmRecord) -> String {
        let mut state = self.state.lock();
        state.apply_insert(&record)
    }

    pub fn records(&self, kind: EntityKind) -> Vec<CrmRecord> {
        let state = self.state.lock();
        state.of_kind(kind).to_vec()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.state.lock().of_kind(kind).len()
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<CrmRecord> {
        let state = self.state.lock();
        state.of_kind(kind).iter().find(|r| id_matches(r, id)).cloned()
    }

    pub fn write_log(&self) -> Vec<WriteEvent> {
        self.state.lock().write_log.clone()
    }

    /// Make every subsequent `batch_flush` fail.
    pub fn fail_flushes(&self, fail: bool) {
        self.state.lock().fail_flushes = fail;
    }

    /// Make every subsequent bulk lookup fail.
    pub fn fail_lookups(&self, fail: bool) {
        self.state.lock().fail_lookups = fail;
    }

    fn find_where<F>(&self, kind: EntityKind, predicate: F) -> Result<Vec<CrmRecord>, CrmError>
    where
        F: Fn(&CrmRecord) -> bool,
    {
        let state = self.state.lock();
        state.check_lookup(kind)?;
        Ok(state
            .of_kind(kind)
            .iter()
            .filter(|r| predicate(r))
            .map(|r| state.hydrate(r))
            .collect())
    }
}

fn lowercase_set(values: &[String]) -> HashSet<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

#[async_trait]
impl CrmPort for InMemoryCrm {
    fn affiliation_model(&self) -> AffiliationModel {
        self.model
    }

    async fn find_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<CrmRecord>, CrmError> {
        self.find_where(kind, |record| ids.iter().any(|id| id_matches(record, id)))
    }

    async fn find_by_ext_ref(
        &self,
        kind: EntityKind,
        field: &str,
        values: &[String],
    ) -> Result<Vec<CrmRecord>, CrmError> {
        let wanted: HashSet<&str> = values.iter().map(String::as_str).collect();
        self.find_where(kind, |record| {
            record.fields.get(field).is_some_and(|v| wanted.contains(v.to_string().as_str()))
        })
    }

    async fn find_by_names(&self, kind: EntityKind, names: &[String]) -> Result<Vec<CrmRecord>, CrmError> {
        let wanted = lowercase_set(names);
        self.find_where(kind, |record| {
            wanted.contains(&record.display_name().to_lowercase())
        })
    }

    async fn find_contacts_by_emails(&self, emails: &[String]) -> Result<Vec<CrmRecord>, CrmError> {
        let wanted = lowercase_set(emails);
        self.find_where(EntityKind::Contact, |record| {
            fields::EMAIL_FIELDS
                .iter()
                .filter_map(|field| record.text(field))
                .any(|email| wanted.contains(&email.to_lowercase()))
        })
    }

    async fn insert(&self, record: &CrmRecord) -> Result<String, CrmError> {
        let mut state = self.state.lock();
        let id = state.apply_insert(record);
        log::trace!("memory store: inserted {} {}", record.kind, id);
        state.write_log.push(WriteEvent {
            op: WriteOp::Insert,
            kind: Some(record.kind),
            id: Some(id.clone()),
        });
        Ok(id)
    }

    async fn update(&self, record: &CrmRecord) -> Result<(), CrmError> {
        let mut state = self.state.lock();
        state.apply_update(record)?;
        state.write_log.push(WriteEvent {
            op: WriteOp::Update,
            kind: Some(record.kind),
            id: record.id.clone(),
        });
        Ok(())
    }

    async fn batch_insert(&self, record: &CrmRecord) -> Result<(), CrmError> {
        let mut state = self.state.lock();
        state.queue.push(QueuedWrite::Insert(record.clone()));
        Ok(())
    }

    async fn batch_update(&self, record: &CrmRecord) -> Result<(), CrmError> {
        let mut state = self.state.lock();
        state.queue.push(QueuedWrite::Update(record.clone()));
        Ok(())
    }

    async fn batch_flush(&self) -> Result<Vec<String>, CrmError> {
        let mut state = self.state.lock();
        let queue = std::mem::take(&mut state.queue);
        if state.fail_flushes {
            return Err(CrmError::Flush(format!(
                "{} queued writes rejected",
                queue.len()
            )));
        }

        let mut inserted = Vec::new();
        for write in queue {
            match write {
                QueuedWrite::Insert(record) => {
                    let id = state.apply_insert(&record);
                    state.write_log.push(WriteEvent {
                        op: WriteOp::BatchInsert,
                        kind: Some(record.kind),
                        id: Some(id.clone()),
                    });
                    inserted.push(id);
                }
                QueuedWrite::Update(record) => {
                    state
                        .apply_update(&record)
                        .map_err(|e| CrmError::Flush(e.to_string()))?;
                    state.write_log.push(WriteEvent {
                        op: WriteOp::BatchUpdate,
                        kind: Some(record.kind),
                        id: record.id.clone(),
                    });
                }
            }
        }

        state.write_log.push(WriteEvent {
            op: WriteOp::Flush,
            kind: None,
            id: None,
        });
        Ok(inserted)
    }

    async fn query_list_auto_paged(&self, query: &CrmQuery) -> Result<Vec<CrmRecord>, CrmError> {
        let state = self.state.lock();
        if state.fail_lookups {
            return Err(CrmError::Query(format!("store unavailable: {}", query)));
        }
        Ok(state
            .of_kind(query.kind)
            .iter()
            .filter(|record| {
                query.filters.iter().all(|(field, value)| {
                    record
                        .fields
                        .get(field)
                        .is_some_and(|stored| stored.loosely_equals(value))
                })
            })
            .map(|r| state.hydrate(r))
            .collect())
    }

    async fn query_single(&self, query: &CrmQuery) -> Result<Option<CrmRecord>, CrmError> {
        Ok(self.query_list_auto_paged(query).await?.into_iter().next())
    }
}
