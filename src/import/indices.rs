//! In-memory match indices for one import run.
//!
//! The indices are built from bulk lookups before the first row is resolved
//! and are then kept current by the resolver as it stages writes. The second
//! pass reads only these indices, never the store.

use crate::config::ImportConfig;
use crate::crm::{CrmError, CrmPort};
use crate::error::ImportError;
use crate::import::affiliation::AffiliationStrategy;
use crate::import::batch::BatchWriteCoordinator;
use crate::import::preprocess::{ImportPlan, LookupKeys};
use crate::models::{CrmRecord, EntityKind, RecordRef, fields};
use std::collections::{HashMap, HashSet};

/// Position of a record inside a [`RecordIndex`].
pub type RecordHandle = usize;

/// Outcome of an external-reference lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtRefHit {
    Found(RecordHandle),
    /// Two different records carry the same value for the field.
    Ambiguous,
}

/// Lookup mappings over the records of one entity kind.
///
/// Records live once in `records`; every mapping stores handles, so the full
/// and short forms of an id resolve to the same record.
#[derive(Debug)]
pub struct RecordIndex {
    kind: EntityKind,
    id_prefix_len: usize,
    records: Vec<CrmRecord>,
    by_id: HashMap<String, RecordHandle>,
    ext_ref_fields: Vec<String>,
    by_ext_ref: HashMap<String, HashMap<String, RecordHandle>>,
    ambiguous_ext_refs: HashSet<(String, String)>,
    by_name: HashMap<String, Vec<RecordHandle>>,
    by_email: HashMap<String, Vec<RecordHandle>>,
    staged: HashMap<RecordRef, RecordHandle>,
    staged_refs: HashMap<RecordHandle, RecordRef>,
}

impl RecordIndex {
    pub fn new(kind: EntityKind, id_prefix_len: usize) -> Self {
        Self {
            kind,
            id_prefix_len,
            records: Vec::new(),
            by_id: HashMap::new(),
            ext_ref_fields: Vec::new(),
            by_ext_ref: HashMap::new(),
            ambiguous_ext_refs: HashSet::new(),
            by_name: HashMap::new(),
            by_email: HashMap::new(),
            staged: HashMap::new(),
            staged_refs: HashMap::new(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Start indexing values of an external-reference field.
    pub fn track_ext_ref_field(&mut self, field: &str) {
        if !self.ext_ref_fields.iter().any(|f| f == field) {
            self.ext_ref_fields.push(field.to_string());
            let existing: Vec<RecordHandle> = (0..self.records.len()).collect();
            for handle in existing {
                self.index_ext_ref(handle, field);
            }
        }
    }

    /// Add a record to every applicable mapping.
    ///
    /// A record whose id is already indexed is not added twice; the existing
    /// handle is returned.
    pub fn insert(&mut self, record: CrmRecord) -> RecordHandle {
        if let Some(handle) = record.id.as_deref().and_then(|id| self.by_id(id)) {
            return handle;
        }

        let handle = self.records.len();
        self.records.push(record);

        if let Some(id) = self.records[handle].id.clone() {
            self.index_id(handle, &id);
        }
        let name = self.records[handle].display_name().to_lowercase();
        if !name.is_empty() {
            self.by_name.entry(name).or_default().push(handle);
        }
        if self.kind == EntityKind::Contact {
            let emails: HashSet<String> = fields::EMAIL_FIELDS
                .iter()
                .filter_map(|field| self.records[handle].text(field))
                .map(str::to_lowercase)
                .collect();
            for email in emails {
                self.by_email.entry(email).or_default().push(handle);
            }
        }
        for field in self.ext_ref_fields.clone() {
            self.index_ext_ref(handle, &field);
        }
        handle
    }

    fn index_id(&mut self, handle: RecordHandle, id: &str) {
        self.by_id.insert(id.to_string(), handle);
        if id.len() > self.id_prefix_len {
            if let Some(short) = id.get(..self.id_prefix_len) {
                self.by_id.insert(short.to_string(), handle);
            }
        }
    }

    fn index_ext_ref(&mut self, handle: RecordHandle, field: &str) {
        let Some(value) = self.records[handle].fields.get(field).map(|v| v.to_string()) else {
            return;
        };
        if value.is_empty() {
            return;
        }
        let values = self.by_ext_ref.entry(field.to_string()).or_default();
        match values.get(&value) {
            Some(existing) if *existing != handle => {
                log::warn!(
                    "{} {} = '{}' is shared by more than one record",
                    self.kind,
                    field,
                    value
                );
                self.ambiguous_ext_refs.insert((field.to_string(), value));
            }
            Some(_) => {}
            None => {
                values.insert(value, handle);
            }
        }
    }

    /// Index a record whose insert is queued and has no id yet.
    pub fn insert_staged(&mut self, record: CrmRecord, reference: RecordRef) -> RecordHandle {
        let handle = self.insert(record);
        self.staged_refs.insert(handle, reference.clone());
        self.staged.insert(reference, handle);
        handle
    }

    /// Record the store id assigned to a staged insert.
    pub fn assign_id(&mut self, handle: RecordHandle, id: &str) {
        self.records[handle].id = Some(id.to_string());
        self.index_id(handle, id);
    }

    /// Assign the flushed id to the record staged under `reference`, if it is indexed here.
    pub fn resolve_staged(&mut self, reference: &RecordRef, id: &str) -> bool {
        match self.staged.remove(reference) {
            Some(handle) => {
                self.staged_refs.remove(&handle);
                self.assign_id(handle, id);
                true
            }
            None => false,
        }
    }

    /// Handle of a record by reference: stored id or pending staged insert.
    pub fn find(&self, reference: &RecordRef) -> Option<RecordHandle> {
        match reference {
            RecordRef::Stored(id) => self.by_id(id),
            staged => self.staged.get(staged).copied(),
        }
    }

    /// Reference for an indexed record.
    pub fn reference(&self, handle: RecordHandle) -> Option<RecordRef> {
        if let Some(id) = &self.records[handle].id {
            return Some(RecordRef::Stored(id.clone()));
        }
        self.staged_refs.get(&handle).cloned()
    }

    /// Fold a staged update into the indexed record so later rows see it.
    pub fn apply_update(&mut self, handle: RecordHandle, update: &CrmRecord) {
        let record = &mut self.records[handle];
        record.fields.merge(&update.fields);
        for field in &update.fields_to_null {
            record.fields.remove(field);
        }
        for field in self.ext_ref_fields.clone() {
            if update.fields.contains(&field) {
                self.index_ext_ref(handle, &field);
            }
        }
    }

    pub fn get(&self, handle: RecordHandle) -> &CrmRecord {
        &self.records[handle]
    }

    pub fn by_id(&self, id: &str) -> Option<RecordHandle> {
        self.by_id.get(id).copied()
    }

    pub fn by_ext_ref(&self, field: &str, value: &str) -> Option<ExtRefHit> {
        if self
            .ambiguous_ext_refs
            .contains(&(field.to_string(), value.to_string()))
        {
            return Some(ExtRefHit::Ambiguous);
        }
        self.by_ext_ref
            .get(field)
            .and_then(|values| values.get(value))
            .map(|handle| ExtRefHit::Found(*handle))
    }

    /// All records sharing a name; the key is compared lowercase.
    pub fn by_name(&self, name: &str) -> &[RecordHandle] {
        self.by_name
            .get(&name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn by_email(&self, email: &str) -> &[RecordHandle] {
        self.by_email
            .get(&email.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Earliest-created record among `handles`. Records created during this run sort last.
    pub fn earliest(&self, handles: &[RecordHandle]) -> Option<RecordHandle> {
        handles
            .iter()
            .copied()
            .min_by_key(|handle| {
                let created_at = self.records[*handle].created_at;
                (created_at.is_none(), created_at, *handle)
            })
    }
}

/// Unordered (contact, organization) pairs that already have a relationship.
#[derive(Debug, Default, Clone)]
pub struct SeenRelationshipSet {
    pairs: HashSet<String>,
}

impl SeenRelationshipSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pair in both orderings.
    pub fn insert(&mut self, a: &str, b: &str) {
        self.pairs.insert(format!("{}::{}", a, b));
        self.pairs.insert(format!("{}::{}", b, a));
    }

    pub fn contains(&self, a: &str, b: &str) -> bool {
        self.pairs.contains(&format!("{}::{}", a, b))
    }

    /// Number of stored orderings (twice the number of pairs).
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// All mutable state threaded through one import run.
pub struct MatchContext {
    pub accounts: RecordIndex,
    pub contacts: RecordIndex,
    pub recurring_donations: RecordIndex,
    pub donations: RecordIndex,
    pub campaigns: RecordIndex,
    pub seen_relationships: SeenRelationshipSet,
    pub writes: BatchWriteCoordinator,
}

impl MatchContext {
    pub fn new(config: &ImportConfig, writes: BatchWriteCoordinator) -> Self {
        let index = |kind| RecordIndex::new(kind, config.id_prefix_len);
        Self {
            accounts: index(EntityKind::Account),
            contacts: index(EntityKind::Contact),
            recurring_donations: index(EntityKind::RecurringDonation),
            donations: index(EntityKind::Donation),
            campaigns: index(EntityKind::Campaign),
            seen_relationships: SeenRelationshipSet::new(),
            writes,
        }
    }

    pub fn index_mut(&mut self, kind: EntityKind) -> Option<&mut RecordIndex> {
        match kind {
            EntityKind::Account => Some(&mut self.accounts),
            EntityKind::Contact => Some(&mut self.contacts),
            EntityKind::RecurringDonation => Some(&mut self.recurring_donations),
            EntityKind::Donation => Some(&mut self.donations),
            EntityKind::Campaign => Some(&mut self.campaigns),
            _ => None,
        }
    }

    /// Id of a campaign by name, case-insensitive.
    pub fn campaign_id_by_name(&self, name: &str) -> Option<String> {
        let handle = self.campaigns.earliest(self.campaigns.by_name(name))?;
        self.campaigns.get(handle).id.clone()
    }
}

/// Issues the bulk lookups that seed a [`MatchContext`].
///
/// Each build operation makes at most one store call per key type. Any lookup
/// failure aborts the run.
pub struct MatchIndexBuilder<'a> {
    port: &'a dyn CrmPort,
}

impl<'a> MatchIndexBuilder<'a> {
    pub fn new(port: &'a dyn CrmPort) -> Self {
        Self { port }
    }

    fn lookup_failed(kind: EntityKind) -> impl Fn(CrmError) -> ImportError {
        move |source| ImportError::BulkLookup { kind, source }
    }

    async fn load_keys(&self, keys: &LookupKeys, index: &mut RecordIndex) -> Result<(), ImportError> {
        let kind = index.kind();
        for field in keys.ext_refs.keys() {
            index.track_ext_ref_field(field);
        }

        if !keys.ids.is_empty() {
            let ids: Vec<String> = keys.ids.iter().cloned().collect();
            let found = self
                .port
                .find_by_ids(kind, &ids)
                .await
                .map_err(Self::lookup_failed(kind))?;
            log::debug!("{} by id: {} requested, {} found", kind, ids.len(), found.len());
            found.into_iter().for_each(|r| {
                index.insert(r);
            });
        }

        for (field, values) in &keys.ext_refs {
            let values: Vec<String> = values.iter().cloned().collect();
            let found = self
                .port
                .find_by_ext_ref(kind, field, &values)
                .await
                .map_err(Self::lookup_failed(kind))?;
            log::debug!("{} by {}: {} requested, {} found", kind, field, values.len(), found.len());
            found.into_iter().for_each(|r| {
                index.insert(r);
            });
        }

        if !keys.names.is_empty() {
            let names: Vec<String> = keys.names.iter().cloned().collect();
            let found = self
                .port
                .find_by_names(kind, &names)
                .await
                .map_err(Self::lookup_failed(kind))?;
            log::debug!("{} by name: {} requested, {} found", kind, names.len(), found.len());
            found.into_iter().for_each(|r| {
                index.insert(r);
            });
        }

        Ok(())
    }

    pub async fn build_account_indices(
        &self,
        plan: &ImportPlan,
        ctx: &mut MatchContext,
    ) -> Result<(), ImportError> {
        self.load_keys(&plan.accounts, &mut ctx.accounts).await
    }

    /// Contacts by id, ExtRef, name and email. Parent accounts that come back
    /// attached to contacts are added to the account index as well.
    pub async fn build_contact_indices(
        &self,
        plan: &ImportPlan,
        ctx: &mut MatchContext,
    ) -> Result<(), ImportError> {
        self.load_keys(&plan.contacts, &mut ctx.contacts).await?;

        if !plan.contact_emails.is_empty() {
            let emails: Vec<String> = plan.contact_emails.iter().cloned().collect();
            let found = self
                .port
                .find_contacts_by_emails(&emails)
                .await
                .map_err(Self::lookup_failed(EntityKind::Contact))?;
            log::debug!("contact by email: {} requested, {} found", emails.len(), found.len());
            for contact in found {
                ctx.contacts.insert(contact);
            }
        }

        for handle in 0..ctx.contacts.len() {
            if let Some(account) = ctx.contacts.get(handle).account.as_deref() {
                ctx.accounts.insert(account.clone());
            }
        }
        Ok(())
    }

    pub async fn build_recurring_donation_index(
        &self,
        plan: &ImportPlan,
        ctx: &mut MatchContext,
    ) -> Result<(), ImportError> {
        self.load_keys(&plan.recurring_donations, &mut ctx.recurring_donations)
            .await
    }

    pub async fn build_donation_index(
        &self,
        plan: &ImportPlan,
        ctx: &mut MatchContext,
    ) -> Result<(), ImportError> {
        self.load_keys(&plan.donations, &mut ctx.donations).await
    }

    /// Campaigns by name (and, in campaign mode, by id and ExtRef).
    pub async fn build_campaign_name_index(
        &self,
        plan: &ImportPlan,
        ctx: &mut MatchContext,
    ) -> Result<(), ImportError> {
        self.load_keys(&plan.campaigns, &mut ctx.campaigns).await
    }

    pub async fn build_affiliation_seen_set(
        &self,
        strategy: &dyn AffiliationStrategy,
        ctx: &mut MatchContext,
    ) -> Result<(), ImportError> {
        ctx.seen_relationships = strategy
            .load_seen(self.port)
            .await
            .map_err(Self::lookup_failed(strategy.relationship_kind()))?;
        log::debug!(
            "affiliation seen set: {} pairs",
            ctx.seen_relationships.len() / 2
        );
        Ok(())
    }
}
