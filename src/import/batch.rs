//! Deduplicated, phased writes.
//!
//! Rows stage writes here instead of calling the store directly. Inserts are
//! keyed by a dedupe key (email or full name for contacts), updates by record
//! id, and a key staged twice is written once. Kinds registered as immediate
//! are inserted on the spot because later work in the same row needs their id;
//! everything else is queued for its phase and sent through the store's batch
//! API when that phase is flushed.

use crate::crm::{CrmError, CrmPort};
use crate::error::ImportError;
use crate::models::{CrmRecord, EntityKind, RecordRef};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Flush phases, in the order a run flushes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum WritePhase {
    AccountsContacts,
    RecurringDonations,
    Donations,
    Campaigns,
}

impl WritePhase {
    pub const ORDER: [WritePhase; 4] = [
        WritePhase::AccountsContacts,
        WritePhase::RecurringDonations,
        WritePhase::Donations,
        WritePhase::Campaigns,
    ];

    pub fn of(kind: EntityKind) -> Self {
        match kind {
            EntityKind::RecurringDonation => WritePhase::RecurringDonations,
            EntityKind::Donation => WritePhase::Donations,
            EntityKind::Campaign | EntityKind::CampaignMember => WritePhase::Campaigns,
            EntityKind::Account
            | EntityKind::Contact
            | EntityKind::Note
            | EntityKind::Affiliation
            | EntityKind::AccountContactRelation => WritePhase::AccountsContacts,
        }
    }
}

impl fmt::Display for WritePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WritePhase::AccountsContacts => "accounts/contacts",
            WritePhase::RecurringDonations => "recurring donations",
            WritePhase::Donations => "donations",
            WritePhase::Campaigns => "campaigns",
        };
        f.write_str(name)
    }
}

/// Result of staging an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staged {
    /// The write was issued (immediate kinds) or queued.
    New(RecordRef),
    /// The dedupe key was already staged; nothing was written.
    Duplicate(RecordRef),
}

impl Staged {
    pub fn reference(&self) -> &RecordRef {
        match self {
            Staged::New(reference) | Staged::Duplicate(reference) => reference,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Staged::New(_))
    }
}

/// Insert and update counts per entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug)]
enum PendingOp {
    Insert { key: String },
    Update,
}

#[derive(Debug)]
struct PendingWrite {
    op: PendingOp,
    record: CrmRecord,
}

/// Staged inserts that received ids during one flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub resolved: Vec<(RecordRef, String)>,
    pub inserted: usize,
    pub updated: usize,
}

/// Dedupe keys and queued writes for the current run.
#[derive(Debug, Default)]
struct PendingWriteSet {
    /// (kind, dedupe key) -> reference handed out for the first insert.
    inserts: HashMap<(EntityKind, String), RecordRef>,
    /// (kind, id) of updates queued since the last flush of their phase.
    updates: HashSet<(EntityKind, String)>,
    queue: BTreeMap<WritePhase, Vec<PendingWrite>>,
}

pub struct BatchWriteCoordinator {
    immediate: HashSet<EntityKind>,
    pending: PendingWriteSet,
    resolved: HashMap<RecordRef, String>,
    counts: BTreeMap<EntityKind, WriteCounts>,
    anonymous: usize,
}

impl BatchWriteCoordinator {
    /// Create a coordinator that inserts `immediate` kinds on the spot.
    pub fn new(immediate: impl IntoIterator<Item = EntityKind>) -> Self {
        Self {
            immediate: immediate.into_iter().collect(),
            pending: PendingWriteSet::default(),
            resolved: HashMap::new(),
            counts: BTreeMap::new(),
            anonymous: 0,
        }
    }

    pub fn is_immediate(&self, kind: EntityKind) -> bool {
        self.immediate.contains(&kind)
    }

    /// Stage an insert.
    ///
    /// # Arguments
    /// * `key` - dedupe key; `None` means the record can never be merged with another insert
    /// * `record` - record to insert, its kind selects the phase
    ///
    /// # Returns
    /// The reference for the record. Immediate kinds come back as `RecordRef::Stored`.
    pub async fn stage_insert(
        &mut self,
        port: &dyn CrmPort,
        key: Option<String>,
        record: CrmRecord,
    ) -> Result<Staged, CrmError> {
        let kind = record.kind;
        let key = match key {
            Some(key) => key,
            None => {
                self.anonymous += 1;
                format!("#{}", self.anonymous)
            }
        };

        if let Some(existing) = self.pending.inserts.get(&(kind, key.clone())) {
            log::debug!("{} insert for '{}' already staged", kind, key);
            return Ok(Staged::Duplicate(existing.clone()));
        }

        let reference = if self.is_immediate(kind) {
            let id = port.insert(&record).await?;
            self.counts.entry(kind).or_default().inserted += 1;
            RecordRef::Stored(id)
        } else {
            self.pending
                .queue
                .entry(WritePhase::of(kind))
                .or_default()
                .push(PendingWrite {
                    op: PendingOp::Insert { key: key.clone() },
                    record,
                });
            RecordRef::Staged {
                kind,
                key: key.clone(),
            }
        };

        self.pending.inserts.insert((kind, key), reference.clone());
        Ok(Staged::New(reference))
    }

    /// Stage an update of an existing record. Returns false when the id was
    /// already staged in the current phase.
    pub fn stage_update(&mut self, record: CrmRecord) -> bool {
        let Some(id) = record.id.clone() else {
            log::warn!("ignoring {} update without an id", record.kind);
            return false;
        };
        if !self.pending.updates.insert((record.kind, id.clone())) {
            log::debug!("{} update for {} already staged", record.kind, id);
            return false;
        }
        self.pending
            .queue
            .entry(WritePhase::of(record.kind))
            .or_default()
            .push(PendingWrite {
                op: PendingOp::Update,
                record,
            });
        true
    }

    pub fn pending_len(&self, phase: WritePhase) -> usize {
        self.pending.queue.get(&phase).map_or(0, Vec::len)
    }

    /// Send every write queued for `phase` through the batch API and flush it.
    ///
    /// A failure here aborts the run; writes already applied by earlier
    /// phases stay applied.
    pub async fn flush(
        &mut self,
        port: &dyn CrmPort,
        phase: WritePhase,
    ) -> Result<FlushReport, ImportError> {
        let writes = self.pending.queue.remove(&phase).unwrap_or_default();
        let fail = |source| ImportError::Flush { phase, source };
        log::debug!("flushing {} ({} writes)", phase, writes.len());

        let mut staged_inserts = Vec::new();
        let mut report = FlushReport::default();
        for write in writes {
            let kind = write.record.kind;
            match write.op {
                PendingOp::Insert { key } => {
                    port.batch_insert(&write.record).await.map_err(fail)?;
                    staged_inserts.push(RecordRef::Staged { kind, key });
                }
                PendingOp::Update => {
                    port.batch_update(&write.record).await.map_err(fail)?;
                    self.pending
                        .updates
                        .remove(&(kind, write.record.id.clone().unwrap_or_default()));
                    self.counts.entry(kind).or_default().updated += 1;
                    report.updated += 1;
                }
            }
        }

        let ids = port.batch_flush().await.map_err(fail)?;
        if ids.len() != staged_inserts.len() {
            return Err(fail(CrmError::Flush(format!(
                "{} inserts queued but {} ids returned",
                staged_inserts.len(),
                ids.len()
            ))));
        }

        for (reference, id) in staged_inserts.into_iter().zip(ids) {
            if let RecordRef::Staged { kind, key } = &reference {
                self.counts.entry(*kind).or_default().inserted += 1;
                self.pending
                    .inserts
                    .insert((*kind, key.clone()), RecordRef::Stored(id.clone()));
            }
            self.resolved.insert(reference.clone(), id.clone());
            report.resolved.push((reference, id));
        }
        report.inserted = report.resolved.len();
        Ok(report)
    }

    /// Store id behind a reference, once its insert has been flushed.
    pub fn resolve(&self, reference: &RecordRef) -> Option<String> {
        match reference {
            RecordRef::Stored(id) => Some(id.clone()),
            staged => self.resolved.get(staged).cloned(),
        }
    }

    pub fn counts(&self, kind: EntityKind) -> WriteCounts {
        self.counts.get(&kind).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{AffiliationModel, InMemoryCrm};
    use crate::models::fields;

    fn contact(email: &str) -> CrmRecord {
        let mut record = CrmRecord::new(EntityKind::Contact);
        record.set(fields::LAST_NAME, "Doe");
        record.set(fields::EMAIL, email);
        record
    }

    #[tokio::test]
    async fn test_same_key_is_staged_once() {
        let store = InMemoryCrm::new(AffiliationModel::JoinObject);
        let mut writes = BatchWriteCoordinator::new([]);

        let first = writes
            .stage_insert(&store, Some("a@x.com".into()), contact("a@x.com"))
            .await
            .unwrap();
        let second = writes
            .stage_insert(&store, Some("a@x.com".into()), contact("a@x.com"))
            .await
            .unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.reference(), second.reference());
        assert_eq!(writes.pending_len(WritePhase::AccountsContacts), 1);

        let report = writes.flush(&store, WritePhase::AccountsContacts).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(store.count(EntityKind::Contact), 1);
        assert_eq!(
            writes.resolve(first.reference()),
            store.records(EntityKind::Contact)[0].id.clone()
        );
    }

    #[tokio::test]
    async fn test_anonymous_inserts_are_never_merged() {
        let store = InMemoryCrm::new(AffiliationModel::JoinObject);
        let mut writes = BatchWriteCoordinator::new([]);
        writes.stage_insert(&store, None, contact("")).await.unwrap();
        writes.stage_insert(&store, None, contact("")).await.unwrap();
        assert_eq!(writes.pending_len(WritePhase::AccountsContacts), 2);
    }

    #[tokio::test]
    async fn test_immediate_kinds_insert_on_the_spot() {
        let store = InMemoryCrm::new(AffiliationModel::JoinObject);
        let mut writes = BatchWriteCoordinator::new([EntityKind::Contact]);
        let staged = writes
            .stage_insert(&store, Some("a@x.com".into()), contact("a@x.com"))
            .await
            .unwrap();

        assert!(matches!(staged.reference(), RecordRef::Stored(_)));
        assert_eq!(store.count(EntityKind::Contact), 1);
        assert_eq!(writes.counts(EntityKind::Contact).inserted, 1);
    }

    #[tokio::test]
    async fn test_update_dedupes_by_id_until_flushed() {
        let store = InMemoryCrm::new(AffiliationModel::JoinObject);
        let id = store.seed(contact("a@x.com"));
        let mut writes = BatchWriteCoordinator::new([]);

        assert!(writes.stage_update(CrmRecord::with_id(EntityKind::Contact, id.clone())));
        assert!(!writes.stage_update(CrmRecord::with_id(EntityKind::Contact, id.clone())));
        writes.flush(&store, WritePhase::AccountsContacts).await.unwrap();
        assert!(writes.stage_update(CrmRecord::with_id(EntityKind::Contact, id)));
        assert_eq!(writes.counts(EntityKind::Contact).updated, 1);
    }

    #[tokio::test]
    async fn test_phases_flush_independently() {
        let store = InMemoryCrm::new(AffiliationModel::JoinObject);
        let mut writes = BatchWriteCoordinator::new([]);
        let mut donation = CrmRecord::new(EntityKind::Donation);
        donation.set(fields::AMOUNT, 10.0);
        writes.stage_insert(&store, None, donation).await.unwrap();

        writes.flush(&store, WritePhase::AccountsContacts).await.unwrap();
        assert_eq!(store.count(EntityKind::Donation), 0);
        writes.flush(&store, WritePhase::Donations).await.unwrap();
        assert_eq!(store.count(EntityKind::Donation), 1);
    }

    #[tokio::test]
    async fn test_flush_failure_is_reported() {
        let store = InMemoryCrm::new(AffiliationModel::JoinObject);
        store.fail_flushes(true);
        let mut writes = BatchWriteCoordinator::new([]);
        writes
            .stage_insert(&store, Some("a@x.com".into()), contact("a@x.com"))
            .await
            .unwrap();

        let err = writes
            .flush(&store, WritePhase::AccountsContacts)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Flush {
                phase: WritePhase::AccountsContacts,
                ..
            }
        ));
    }
}
