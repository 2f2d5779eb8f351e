//! Per-row account/contact resolution.
//!
//! Each row is classified against the in-memory indices, in strict priority
//! order:
//!
//! 1. **Second pass** - upsert the account by name, insert the contact
//! 2. **Account-only row** - upsert the account, no contact work
//! 3. **Contact ID** found in the by-id index
//! 4. **Contact ExtRef** found in the by-ExtRef index
//! 5. **Email** found in the by-email index (earliest-created contact wins)
//! 6. **First + last name** bucket, filtered by shared street or phone
//! 7. **Any other lookup key** - defer the row to the second pass
//! 8. **No lookup key** - no contact action
//!
//! Once a row is resolved its campaign memberships, notes and organization
//! affiliations are attached.

use crate::config::ImportConfig;
use crate::crm::{CrmError, CrmPort};
use crate::error::ImportError;
use crate::import::affiliation::{AffiliationLink, AffiliationOutcome, AffiliationStrategy};
use crate::import::batch::{BatchWriteCoordinator, Staged};
use crate::import::coercion::{apply_custom_fields, is_clear_token, is_truthy};
use crate::import::indices::{ExtRefHit, MatchContext, RecordHandle, RecordIndex};
use crate::import::preprocess::{ImportPlan, RowFeatures};
use crate::import::row::{
    ANONYMOUS_LAST_NAME, CampaignOwner, CampaignRef, EMAIL_COLUMNS, ExtRef, ImportRow,
    OrganizationRef,
    normalize_email, normalize_phone, normalize_street,
};
use crate::models::{CrmRecord, EntityKind, RecordRef, fields};
use serde::Serialize;
use std::collections::HashSet;

const NOTE_TITLE_MAX_LEN: usize = 80;

const ACCOUNT_COLUMNS: [(&str, &str); 14] = [
    ("Account Description", fields::DESCRIPTION),
    ("Account Phone", fields::PHONE),
    ("Account Website", fields::WEBSITE),
    ("Account Type", fields::TYPE),
    ("Account Owner ID", fields::OWNER_ID),
    ("Account Record Type ID", fields::RECORD_TYPE_ID),
    ("Account Billing City", fields::BILLING_CITY),
    ("Account Billing State", fields::BILLING_STATE),
    ("Account Billing Postal Code", fields::BILLING_POSTAL_CODE),
    ("Account Billing Country", fields::BILLING_COUNTRY),
    ("Account Shipping City", fields::SHIPPING_CITY),
    ("Account Shipping State", fields::SHIPPING_STATE),
    ("Account Shipping Postal Code", fields::SHIPPING_POSTAL_CODE),
    ("Account Shipping Country", fields::SHIPPING_COUNTRY),
];

const CONTACT_COLUMNS: [(&str, &str); 12] = [
    ("Contact Salutation", fields::SALUTATION),
    ("Contact Description", fields::DESCRIPTION),
    ("Contact Phone", fields::PHONE),
    ("Contact Home Phone", fields::HOME_PHONE),
    ("Contact Mobile Phone", fields::MOBILE_PHONE),
    ("Contact Work Phone", fields::WORK_PHONE),
    ("Contact Mailing City", fields::MAILING_CITY),
    ("Contact Mailing State", fields::MAILING_STATE),
    ("Contact Mailing Postal Code", fields::MAILING_POSTAL_CODE),
    ("Contact Mailing Country", fields::MAILING_COUNTRY),
    ("Contact Owner ID", fields::OWNER_ID),
    ("Contact Record Type ID", fields::RECORD_TYPE_ID),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    First,
    Second,
}

/// Which index matched an existing contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchSource {
    Id,
    ExtRef,
    Email,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContactDecision {
    Matched(MatchSource),
    Inserted,
    /// Flagged for insertion in the second pass.
    Deferred,
    AccountOnly,
    NoLookupKey,
}

/// What the resolver did with one row.
#[derive(Debug, Clone)]
pub struct RowOutcome {
    pub decision: ContactDecision,
    pub account: Option<RecordRef>,
    pub contact: Option<RecordRef>,
    pub coercion_failures: usize,
}

impl RowOutcome {
    fn new(decision: ContactDecision) -> Self {
        Self {
            decision,
            account: None,
            contact: None,
            coercion_failures: 0,
        }
    }
}

enum ContactMatch {
    Found(RecordHandle, MatchSource),
    Defer,
    NoKey,
}

pub(crate) fn row_failed(row: usize) -> impl Fn(CrmError) -> ImportError {
    move |source| ImportError::Row { row, source }
}

/// Copy a cell into a record field; the clear sentinel nulls the field instead.
pub(crate) fn copy_cell(row: &ImportRow, record: &mut CrmRecord, column: &str, field: &str) {
    match row.value(column) {
        Some(value) if is_clear_token(value) => record.null_field(field),
        Some(value) => record.set(field, value),
        None => {}
    }
}

/// Street plus an optional second address line.
fn copy_street(row: &ImportRow, record: &mut CrmRecord, prefix: &str, field: &str) {
    let street = row.value(&format!("{} Street", prefix));
    let line2 = row.lookup_value(&format!("{} Address 2", prefix));
    match (street, line2) {
        (Some(street), _) if is_clear_token(street) => record.null_field(field),
        (Some(street), Some(line2)) => record.set(field, format!("{}, {}", street, line2)),
        (Some(street), None) => record.set(field, street),
        (None, _) => {}
    }
}

/// Set ExtRef fields on an insert, or on an update when the record has no value yet.
fn set_ext_refs(record: &mut CrmRecord, ext_refs: &[ExtRef], existing: Option<&CrmRecord>) {
    for ext_ref in ext_refs {
        let missing = existing.is_none_or(|e| e.text(&ext_ref.field).is_none());
        if missing {
            record.set(ext_ref.field.clone(), ext_ref.value.clone());
        }
    }
}

/// Index a freshly staged insert and return its handle.
pub(crate) fn index_staged(index: &mut RecordIndex, staged: Staged, mut record: CrmRecord) -> Option<RecordHandle> {
    match staged {
        Staged::New(RecordRef::Stored(id)) => {
            record.id = Some(id);
            Some(index.insert(record))
        }
        Staged::New(reference) => Some(index.insert_staged(record, reference)),
        Staged::Duplicate(reference) => index.find(&reference),
    }
}

/// Queue an update and fold it into the index. Empty updates, and updates
/// dropped because the record already has one staged, leave the index as is.
pub(crate) fn stage_indexed_update(
    index: &mut RecordIndex,
    writes: &mut BatchWriteCoordinator,
    handle: RecordHandle,
    update: CrmRecord,
) -> bool {
    if update.fields.is_empty() && update.fields_to_null.is_empty() {
        return false;
    }
    if !writes.stage_update(update.clone()) {
        return false;
    }
    index.apply_update(handle, &update);
    true
}

/// First ExtRef on the row that hits the index. Two records sharing a value is an error.
pub(crate) fn find_by_ext_refs(
    index: &RecordIndex,
    ext_refs: &[ExtRef],
    row: usize,
) -> Result<Option<RecordHandle>, ImportError> {
    for ext_ref in ext_refs {
        match index.by_ext_ref(&ext_ref.field, &ext_ref.value) {
            Some(ExtRefHit::Found(handle)) => return Ok(Some(handle)),
            Some(ExtRefHit::Ambiguous) => {
                return Err(ImportError::AmbiguousMatch {
                    row,
                    kind: index.kind(),
                    key: format!("{} = {}", ext_ref.field, ext_ref.value),
                });
            }
            None => {}
        }
    }
    Ok(None)
}

/// Streets and phones a contact has on file, normalized.
fn contact_streets_and_phones(
    ctx: &MatchContext,
    contact: &CrmRecord,
) -> (HashSet<String>, HashSet<String>) {
    let account = contact.account.as_deref().or_else(|| {
        contact
            .account_id()
            .and_then(|id| ctx.accounts.by_id(id))
            .map(|handle| ctx.accounts.get(handle))
    });

    let mut streets: HashSet<String> = contact
        .text(fields::MAILING_STREET)
        .map(normalize_street)
        .into_iter()
        .collect();
    if let Some(account) = account {
        for field in [fields::BILLING_STREET, fields::SHIPPING_STREET] {
            streets.extend(account.text(field).map(normalize_street));
        }
    }
    streets.retain(|s| !s.is_empty());

    let phones: HashSet<String> = fields::PHONE_FIELDS
        .iter()
        .filter_map(|field| contact.text(field))
        .map(normalize_phone)
        .filter(|p| !p.is_empty())
        .collect();
    (streets, phones)
}

/// Name-bucket filter. A contact with neither street nor phone on file always passes.
fn shares_street_or_phone(
    ctx: &MatchContext,
    contact: &CrmRecord,
    streets: &HashSet<String>,
    phones: &HashSet<String>,
) -> bool {
    let (on_file_streets, on_file_phones) = contact_streets_and_phones(ctx, contact);
    if on_file_streets.is_empty() && on_file_phones.is_empty() {
        return true;
    }
    !on_file_streets.is_disjoint(streets) || !on_file_phones.is_disjoint(phones)
}

/// Id of the campaign named `name`, inserting and indexing it when missing.
///
/// Returns `None` only when campaign inserts are queued and the new id is not
/// known yet.
pub async fn ensure_campaign(
    port: &dyn CrmPort,
    ctx: &mut MatchContext,
    name: &str,
) -> Result<Option<String>, CrmError> {
    if let Some(id) = ctx.campaign_id_by_name(name) {
        return Ok(Some(id));
    }
    let mut campaign = CrmRecord::new(EntityKind::Campaign);
    campaign.set(fields::NAME, name);
    let staged = ctx
        .writes
        .stage_insert(port, Some(name.to_lowercase()), campaign.clone())
        .await?;
    let id = staged.reference().id().map(str::to_string);
    if staged.is_new() {
        log::info!("created campaign '{}'", name);
    }
    index_staged(&mut ctx.campaigns, staged, campaign);
    Ok(id)
}

/// Applies the per-row decision tree and its side effects.
pub struct RecordResolver<'a> {
    port: &'a dyn CrmPort,
    config: &'a ImportConfig,
    plan: &'a ImportPlan,
    affiliations: &'a dyn AffiliationStrategy,
}

impl<'a> RecordResolver<'a> {
    pub fn new(
        port: &'a dyn CrmPort,
        config: &'a ImportConfig,
        plan: &'a ImportPlan,
        affiliations: &'a dyn AffiliationStrategy,
    ) -> Self {
        Self {
            port,
            config,
            plan,
            affiliations,
        }
    }

    /// Resolve one row.
    ///
    /// # Arguments
    /// * `ctx` - indices and pending writes for the run
    /// * `row` - the row; `deferred_to_second_pass` is set when the first pass defers it
    /// * `features` - the row's flags from the preprocessor
    /// * `pass` - which scheduler pass is running
    ///
    /// # Returns
    /// The decision plus account/contact references for dependent phases.
    pub async fn resolve(
        &self,
        ctx: &mut MatchContext,
        row: &mut ImportRow,
        features: RowFeatures,
        pass: Pass,
    ) -> Result<RowOutcome, ImportError> {
        let mut outcome = RowOutcome::new(ContactDecision::NoLookupKey);
        let mut account = self.find_explicit_account(ctx, row)?;
        // Accounts found by name are written inside the upsert
        let mut account_written = false;

        let contact = if pass == Pass::Second {
            let handle = match account {
                Some(handle) => handle,
                None => {
                    account_written = true;
                    let name = row.household_name(&self.config.household_suffix);
                    self.upsert_account_by_name(ctx, row, &name, &mut outcome)
                        .await?
                }
            };
            account = Some(handle);
            outcome.decision = ContactDecision::Inserted;
            self.insert_contact(ctx, row, handle, &mut outcome).await?
        } else if features.has_account_columns
            && !row.has_contact_lookup_key()
            && row.account_name().is_some()
        {
            if account.is_none() {
                let name = row.account_name().unwrap_or_default().to_string();
                account_written = true;
                account = Some(
                    self.upsert_account_by_name(ctx, row, &name, &mut outcome)
                        .await?,
                );
            }
            outcome.decision = ContactDecision::AccountOnly;
            None
        } else {
            match self.match_contact(ctx, row)? {
                ContactMatch::Found(handle, source) => {
                    log::trace!("row {}: contact matched by {:?}", row.number, source);
                    outcome.decision = ContactDecision::Matched(source);
                    if account.is_none() {
                        account = ctx
                            .contacts
                            .get(handle)
                            .account_id()
                            .and_then(|id| ctx.accounts.by_id(id));
                    }
                    self.update_contact(ctx, row, handle, account, &mut outcome);
                    Some(handle)
                }
                ContactMatch::Defer => {
                    log::debug!("row {}: no contact match, deferring to second pass", row.number);
                    row.deferred_to_second_pass = true;
                    outcome.decision = ContactDecision::Deferred;
                    return Ok(outcome);
                }
                ContactMatch::NoKey => None,
            }
        };

        if let (Some(handle), false) = (account, account_written) {
            self.update_account(ctx, row, handle, &mut outcome);
        }

        outcome.account = account.and_then(|handle| ctx.accounts.reference(handle));
        outcome.contact = contact.and_then(|handle| ctx.contacts.reference(handle));
        self.attach_related(ctx, row, &outcome).await?;
        Ok(outcome)
    }

    /// `Account ID`, then `Account ExtRef` columns.
    fn find_explicit_account(
        &self,
        ctx: &MatchContext,
        row: &ImportRow,
    ) -> Result<Option<RecordHandle>, ImportError> {
        if let Some(handle) = row.account_id().and_then(|id| ctx.accounts.by_id(id)) {
            return Ok(Some(handle));
        }
        find_by_ext_refs(&ctx.accounts, &row.ext_refs(EntityKind::Account), row.number)
    }

    fn match_contact(&self, ctx: &MatchContext, row: &ImportRow) -> Result<ContactMatch, ImportError> {
        let contacts = &ctx.contacts;

        if let Some(handle) = row.contact_id().and_then(|id| contacts.by_id(id)) {
            return Ok(ContactMatch::Found(handle, MatchSource::Id));
        }

        if let Some(handle) =
            find_by_ext_refs(contacts, &row.ext_refs(EntityKind::Contact), row.number)?
        {
            return Ok(ContactMatch::Found(handle, MatchSource::ExtRef));
        }

        for email in &row.emails {
            if let Some(handle) = contacts.earliest(contacts.by_email(email)) {
                return Ok(ContactMatch::Found(handle, MatchSource::Email));
            }
        }

        // A name alone is not enough; the row must carry a street or phone to compare
        let streets: HashSet<String> = row.street_candidates().into_iter().collect();
        let phones: HashSet<String> = row.phone_candidates().into_iter().collect();
        if let Some(key) = row
            .name_key()
            .filter(|_| !streets.is_empty() || !phones.is_empty())
        {
            let bucket = contacts.by_name(&key);
            if !bucket.is_empty() {
                let survivors: Vec<RecordHandle> = bucket
                    .iter()
                    .copied()
                    .filter(|h| shares_street_or_phone(ctx, contacts.get(*h), &streets, &phones))
                    .collect();
                if let Some(handle) = contacts.earliest(&survivors) {
                    return Ok(ContactMatch::Found(handle, MatchSource::Name));
                }
                log::debug!(
                    "row {}: {} contacts named '{}', none share a street or phone",
                    row.number,
                    bucket.len(),
                    key
                );
                return Ok(ContactMatch::Defer);
            }
        }

        if row.has_contact_lookup_key() {
            Ok(ContactMatch::Defer)
        } else {
            Ok(ContactMatch::NoKey)
        }
    }

    fn set_account_fields(&self, row: &ImportRow, record: &mut CrmRecord) {
        for (column, field) in ACCOUNT_COLUMNS {
            copy_cell(row, record, column, field);
        }
        copy_street(row, record, "Account Billing", fields::BILLING_STREET);
        copy_street(row, record, "Account Shipping", fields::SHIPPING_STREET);
    }

    fn set_contact_fields(&self, row: &ImportRow, record: &mut CrmRecord) {
        if let Some(first) = &row.first_name {
            record.set(fields::FIRST_NAME, first.as_str());
        }
        if let Some(last) = &row.last_name {
            record.set(fields::LAST_NAME, last.as_str());
        }
        for (column, field) in CONTACT_COLUMNS {
            copy_cell(row, record, column, field);
        }
        copy_street(row, record, "Contact Mailing", fields::MAILING_STREET);

        for (column, field) in EMAIL_COLUMNS.into_iter().zip(fields::EMAIL_FIELDS) {
            match row.value(column) {
                Some(value) if is_clear_token(value) => record.null_field(field),
                Some(value) => {
                    if let Some(email) = normalize_email(value) {
                        record.set(field, email);
                    }
                }
                None => {}
            }
        }

        let opt_columns = [
            ("Contact Email Opt In", &self.config.email_opt_in_field),
            ("Contact Email Opt Out", &self.config.email_opt_out_field),
            ("Contact SMS Opt In", &self.config.sms_opt_in_field),
            ("Contact SMS Opt Out", &self.config.sms_opt_out_field),
        ];
        for (column, field) in opt_columns {
            if let (Some(field), Some(value)) = (field.as_deref(), row.lookup_value(column)) {
                record.set(field, is_truthy(value));
            }
        }
    }

    fn update_account(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        handle: RecordHandle,
        outcome: &mut RowOutcome,
    ) {
        if !self.plan.has_account_columns {
            return;
        }
        let existing = ctx.accounts.get(handle);
        let Some(id) = existing.id.clone() else {
            return;
        };
        let mut update = CrmRecord::with_id(EntityKind::Account, id);
        self.set_account_fields(row, &mut update);
        set_ext_refs(&mut update, &row.ext_refs(EntityKind::Account), Some(existing));
        outcome.coercion_failures += apply_custom_fields(
            &mut update,
            Some(existing),
            row.custom_fields(EntityKind::Account),
            row.number,
        );
        stage_indexed_update(&mut ctx.accounts, &mut ctx.writes, handle, update);
    }

    async fn upsert_account_by_name(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        name: &str,
        outcome: &mut RowOutcome,
    ) -> Result<RecordHandle, ImportError> {
        if let Some(handle) = ctx.accounts.earliest(ctx.accounts.by_name(name)) {
            self.update_account(ctx, row, handle, outcome);
            return Ok(handle);
        }

        let mut account = CrmRecord::new(EntityKind::Account);
        account.set(fields::NAME, name);
        self.set_account_fields(row, &mut account);
        set_ext_refs(&mut account, &row.ext_refs(EntityKind::Account), None);
        outcome.coercion_failures += apply_custom_fields(
            &mut account,
            None,
            row.custom_fields(EntityKind::Account),
            row.number,
        );

        let staged = ctx
            .writes
            .stage_insert(self.port, Some(name.to_lowercase()), account.clone())
            .await
            .map_err(row_failed(row.number))?;
        log::debug!("row {}: account '{}' staged as {:?}", row.number, name, staged);
        index_staged(&mut ctx.accounts, staged, account).ok_or_else(|| ImportError::Row {
            row: row.number,
            source: CrmError::NotFound {
                kind: EntityKind::Account,
                id: name.to_string(),
            },
        })
    }

    fn update_contact(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        handle: RecordHandle,
        account: Option<RecordHandle>,
        outcome: &mut RowOutcome,
    ) {
        let existing = ctx.contacts.get(handle);
        let Some(id) = existing.id.clone() else {
            log::debug!("row {}: matched contact is not flushed yet, no update", row.number);
            return;
        };
        let mut update = CrmRecord::with_id(EntityKind::Contact, id);
        self.set_contact_fields(row, &mut update);
        if let Some(account_id) = account.and_then(|h| ctx.accounts.get(h).id.as_deref()) {
            if existing.account_id() != Some(account_id) {
                update.set(fields::ACCOUNT_ID, account_id);
            }
        }
        set_ext_refs(&mut update, &row.ext_refs(EntityKind::Contact), Some(existing));
        outcome.coercion_failures += apply_custom_fields(
            &mut update,
            Some(existing),
            row.custom_fields(EntityKind::Contact),
            row.number,
        );
        stage_indexed_update(&mut ctx.contacts, &mut ctx.writes, handle, update);
    }

    /// Insert dedupe key: first email, else the lowercase full name. Anonymous contacts get none.
    fn contact_dedupe_key(row: &ImportRow) -> Option<String> {
        if let Some(email) = row.emails.first() {
            return Some(email.clone());
        }
        row.last_name
            .as_deref()
            .filter(|last| !last.eq_ignore_ascii_case(ANONYMOUS_LAST_NAME))
            .map(|_| row.full_name().to_lowercase())
    }

    async fn insert_contact(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        account: RecordHandle,
        outcome: &mut RowOutcome,
    ) -> Result<Option<RecordHandle>, ImportError> {
        let mut contact = CrmRecord::new(EntityKind::Contact);
        self.set_contact_fields(row, &mut contact);
        if row.last_name.is_none() {
            contact.set(fields::LAST_NAME, ANONYMOUS_LAST_NAME);
        }
        if let Some(account_id) = ctx.accounts.get(account).id.clone() {
            contact.set(fields::ACCOUNT_ID, account_id);
        }
        set_ext_refs(&mut contact, &row.ext_refs(EntityKind::Contact), None);
        outcome.coercion_failures += apply_custom_fields(
            &mut contact,
            None,
            row.custom_fields(EntityKind::Contact),
            row.number,
        );
        // fields_to_null has no meaning on an insert
        contact.fields_to_null.clear();

        let staged = ctx
            .writes
            .stage_insert(self.port, Self::contact_dedupe_key(row), contact.clone())
            .await
            .map_err(row_failed(row.number))?;
        if !staged.is_new() {
            log::debug!("row {}: contact insert already staged by an earlier row", row.number);
        }
        Ok(index_staged(&mut ctx.contacts, staged, contact))
    }

    async fn attach_related(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        outcome: &RowOutcome,
    ) -> Result<(), ImportError> {
        let account_id = outcome.account.as_ref().and_then(RecordRef::id);
        let contact_id = outcome.contact.as_ref().and_then(RecordRef::id);

        let members = [
            (CampaignOwner::Contact, fields::CONTACT_ID, contact_id),
            (CampaignOwner::Account, fields::ACCOUNT_ID, account_id),
        ];
        for (owner, member_field, member_id) in members {
            let Some(member_id) = member_id else {
                continue;
            };
            for campaign in row.campaigns(owner, self.config.campaign_slots) {
                self.add_campaign_member(ctx, row, campaign, member_field, member_id)
                    .await?;
            }
        }

        for (column, parent_id) in [("Account Note", account_id), ("Contact Note", contact_id)] {
            if let (Some(body), Some(parent_id)) = (row.lookup_value(column), parent_id) {
                let mut note = CrmRecord::new(EntityKind::Note);
                note.set(fields::PARENT_ID, parent_id);
                note.set(
                    fields::TITLE,
                    body.chars().take(NOTE_TITLE_MAX_LEN).collect::<String>(),
                );
                note.set(fields::BODY, body);
                ctx.writes
                    .stage_insert(self.port, None, note)
                    .await
                    .map_err(row_failed(row.number))?;
            }
        }

        if let Some(contact_id) = contact_id {
            for organization in row.organizations(self.config.organization_slots) {
                self.affiliate_organization(ctx, row, contact_id, &organization)
                    .await?;
            }
        }
        Ok(())
    }

    async fn add_campaign_member(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        campaign: CampaignRef,
        member_field: &str,
        member_id: &str,
    ) -> Result<(), ImportError> {
        let campaign_id = match campaign {
            CampaignRef::Id(id) => Some(
                ctx.campaigns
                    .by_id(&id)
                    .and_then(|h| ctx.campaigns.get(h).id.clone())
                    .unwrap_or(id),
            ),
            CampaignRef::Name(name) => ensure_campaign(self.port, ctx, &name)
                .await
                .map_err(row_failed(row.number))?,
        };
        let Some(campaign_id) = campaign_id else {
            log::warn!("row {}: campaign has no id yet, membership skipped", row.number);
            return Ok(());
        };

        let mut member = CrmRecord::new(EntityKind::CampaignMember);
        member.set(fields::CAMPAIGN_ID, campaign_id.as_str());
        member.set(member_field, member_id);
        let key = format!("{}::{}", campaign_id, member_id);
        ctx.writes
            .stage_insert(self.port, Some(key), member)
            .await
            .map_err(row_failed(row.number))?;
        Ok(())
    }

    /// Organization by id, then ExtRef, then name; updated if found, inserted otherwise.
    async fn resolve_organization(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        organization: &OrganizationRef,
    ) -> Result<Option<RecordHandle>, ImportError> {
        let mut handle = organization
            .id
            .as_deref()
            .and_then(|id| ctx.accounts.by_id(id));
        if handle.is_none() {
            handle = find_by_ext_refs(&ctx.accounts, &organization.ext_refs, row.number)?;
        }
        if handle.is_none() {
            handle = organization
                .name
                .as_deref()
                .and_then(|name| ctx.accounts.earliest(ctx.accounts.by_name(name)));
        }

        if let Some(handle) = handle {
            let existing = ctx.accounts.get(handle);
            if let Some(id) = existing.id.clone() {
                let mut update = CrmRecord::with_id(EntityKind::Account, id);
                for (field, value) in &organization.address {
                    if existing.text(field) != Some(value.as_str()) {
                        update.set(*field, value.as_str());
                    }
                }
                set_ext_refs(&mut update, &organization.ext_refs, Some(existing));
                stage_indexed_update(&mut ctx.accounts, &mut ctx.writes, handle, update);
            }
            return Ok(Some(handle));
        }

        let Some(name) = organization.name.as_deref() else {
            return Ok(None);
        };
        let mut account = CrmRecord::new(EntityKind::Account);
        account.set(fields::NAME, name);
        for (field, value) in &organization.address {
            account.set(*field, value.as_str());
        }
        set_ext_refs(&mut account, &organization.ext_refs, None);
        let staged = ctx
            .writes
            .stage_insert(self.port, Some(name.to_lowercase()), account.clone())
            .await
            .map_err(row_failed(row.number))?;
        Ok(index_staged(&mut ctx.accounts, staged, account))
    }

    async fn affiliate_organization(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        contact_id: &str,
        organization: &OrganizationRef,
    ) -> Result<(), ImportError> {
        let org_id = match self.resolve_organization(ctx, row, organization).await? {
            Some(handle) => ctx.accounts.get(handle).id.clone(),
            None => None,
        };
        let Some(org_id) = org_id else {
            log::warn!(
                "row {}: organization {} could not be resolved, skipping affiliation",
                row.number,
                organization.slot
            );
            return Ok(());
        };

        let contact_account_id = ctx
            .contacts
            .by_id(contact_id)
            .and_then(|h| ctx.contacts.get(h).account_id())
            .map(str::to_string);
        let link = AffiliationLink {
            contact_id,
            contact_account_id: contact_account_id.as_deref(),
            organization_id: &org_id,
            role: organization.role.as_deref(),
        };
        let result = self
            .affiliations
            .affiliate(self.port, ctx, link)
            .await
            .map_err(row_failed(row.number))?;
        if result == AffiliationOutcome::AlreadyLinked {
            log::trace!("row {}: {} already affiliated with {}", row.number, contact_id, org_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{AffiliationModel, InMemoryCrm};
    use crate::import::affiliation::strategy_for;
    use crate::import::batch::WritePhase;
    use crate::import::preprocess::build_import_plan;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        store: InMemoryCrm,
        config: ImportConfig,
        ctx: MatchContext,
    }

    impl Fixture {
        fn new() -> Self {
            let config = ImportConfig::from_env();
            let writes = BatchWriteCoordinator::new([
                EntityKind::Account,
                EntityKind::Note,
                EntityKind::Campaign,
            ]);
            Self {
                store: InMemoryCrm::new(AffiliationModel::JoinObject),
                ctx: MatchContext::new(&config, writes),
                config,
            }
        }

        fn contact(&mut self, id: &str, year: i32, cells: &[(&str, &str)]) -> RecordHandle {
            let mut record = CrmRecord::with_id(EntityKind::Contact, id);
            for (field, value) in cells {
                record.set(*field, *value);
            }
            record.created_at = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single();
            self.ctx.contacts.insert(record)
        }

        async fn resolve(
            &mut self,
            cells: &[(&str, &str)],
            pass: Pass,
        ) -> Result<(RowOutcome, ImportRow), ImportError> {
            let mut row = ImportRow::new(2, cells.iter().copied());
            let plan = build_import_plan(std::slice::from_ref(&row), &self.config);
            let strategy = strategy_for(self.store.affiliation_model());
            let resolver = RecordResolver::new(&self.store, &self.config, &plan, strategy.as_ref());
            let outcome = resolver
                .resolve(&mut self.ctx, &mut row, plan.rows[0], pass)
                .await?;
            Ok((outcome, row))
        }
    }

    const JANE_DOE: [(&str, &str); 2] = [(fields::FIRST_NAME, "Jane"), (fields::LAST_NAME, "Doe")];

    #[tokio::test]
    async fn test_contact_id_beats_name_candidate() {
        let mut fx = Fixture::new();
        fx.contact("003000000000001AAA", 2019, &JANE_DOE);
        fx.contact("003000000000002AAA", 2021, &JANE_DOE);

        let (outcome, _) = fx
            .resolve(
                &[
                    ("Contact ID", "003000000000002"),
                    ("Contact First Name", "Jane"),
                    ("Contact Last Name", "Doe"),
                ],
                Pass::First,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, ContactDecision::Matched(MatchSource::Id));
        assert_eq!(
            outcome.contact,
            Some(RecordRef::Stored("003000000000002AAA".to_string()))
        );
    }

    #[tokio::test]
    async fn test_ext_ref_outranks_email() {
        let mut fx = Fixture::new();
        fx.ctx.contacts.track_ext_ref_field("SourceId");
        fx.contact(
            "003000000000001AAA",
            2020,
            &[(fields::LAST_NAME, "Doe"), ("SourceId", "77")],
        );
        fx.contact(
            "003000000000002AAA",
            2019,
            &[(fields::LAST_NAME, "Roe"), (fields::EMAIL, "a@x.com")],
        );

        let (outcome, _) = fx
            .resolve(
                &[("Contact ExtRef SourceId", "77"), ("Contact Email", "a@x.com")],
                Pass::First,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, ContactDecision::Matched(MatchSource::ExtRef));
        assert_eq!(outcome.contact.as_ref().and_then(RecordRef::id), Some("003000000000001AAA"));
    }

    #[tokio::test]
    async fn test_shared_ext_ref_value_is_ambiguous() {
        let mut fx = Fixture::new();
        fx.ctx.contacts.track_ext_ref_field("SourceId");
        fx.contact("003000000000001AAA", 2020, &[("SourceId", "77")]);
        fx.contact("003000000000002AAA", 2021, &[("SourceId", "77")]);

        let result = fx
            .resolve(&[("Contact ExtRef SourceId", "77")], Pass::First)
            .await;

        assert!(matches!(result, Err(ImportError::AmbiguousMatch { row: 2, .. })));
    }

    #[tokio::test]
    async fn test_earliest_created_email_match_wins() {
        let mut fx = Fixture::new();
        fx.contact("003000000000001AAA", 2022, &[(fields::EMAIL, "a@x.com")]);
        fx.contact("003000000000002AAA", 2018, &[(fields::WORK_EMAIL, "A@X.com")]);

        let (outcome, _) = fx
            .resolve(&[("Contact Email", "a@x.com")], Pass::First)
            .await
            .unwrap();

        assert_eq!(outcome.decision, ContactDecision::Matched(MatchSource::Email));
        assert_eq!(outcome.contact.as_ref().and_then(RecordRef::id), Some("003000000000002AAA"));
        assert_eq!(fx.ctx.writes.pending_len(WritePhase::AccountsContacts), 1);
    }

    #[tokio::test]
    async fn test_name_match_requires_shared_street_or_phone() {
        let mut fx = Fixture::new();
        fx.contact(
            "003000000000001AAA",
            2020,
            &[
                (fields::FIRST_NAME, "Jane"),
                (fields::LAST_NAME, "Doe"),
                (fields::MAILING_STREET, "123 Main St."),
            ],
        );

        let (outcome, row) = fx
            .resolve(
                &[
                    ("Contact First Name", "Jane"),
                    ("Contact Last Name", "Doe"),
                    ("Contact Mailing Street", "9 Elm Road"),
                ],
                Pass::First,
            )
            .await
            .unwrap();
        assert_eq!(outcome.decision, ContactDecision::Deferred);
        assert!(row.deferred_to_second_pass);

        let (outcome, _) = fx
            .resolve(
                &[
                    ("Contact First Name", "Jane"),
                    ("Contact Last Name", "Doe"),
                    ("Contact Mailing Street", "123 main st"),
                ],
                Pass::First,
            )
            .await
            .unwrap();
        assert_eq!(outcome.decision, ContactDecision::Matched(MatchSource::Name));
    }

    #[tokio::test]
    async fn test_contact_without_street_or_phone_matches_by_name() {
        let mut fx = Fixture::new();
        fx.contact("003000000000001AAA", 2020, &JANE_DOE);

        let (outcome, row) = fx
            .resolve(
                &[
                    ("Contact First Name", "Jane"),
                    ("Contact Last Name", "Doe"),
                    ("Contact Mailing Street", "9 Elm Road"),
                    ("Contact Phone", "(555) 010-0000"),
                ],
                Pass::First,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, ContactDecision::Matched(MatchSource::Name));
        assert!(!row.deferred_to_second_pass);
    }

    #[tokio::test]
    async fn test_name_only_row_is_deferred_not_matched() {
        let mut fx = Fixture::new();
        fx.contact("003000000000001AAA", 2020, &JANE_DOE);

        let (outcome, row) = fx
            .resolve(
                &[("Contact First Name", "Jane"), ("Contact Last Name", "Doe")],
                Pass::First,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, ContactDecision::Deferred);
        assert!(row.deferred_to_second_pass);
    }

    #[test]
    fn test_dropped_update_leaves_index_untouched() {
        let mut fx = Fixture::new();
        let handle = fx.contact("003000000000001AAA", 2020, &JANE_DOE);
        let update = |phone: &str| {
            let mut record = CrmRecord::with_id(EntityKind::Contact, "003000000000001AAA");
            record.set(fields::PHONE, phone);
            record
        };

        assert!(stage_indexed_update(
            &mut fx.ctx.contacts,
            &mut fx.ctx.writes,
            handle,
            update("111")
        ));
        assert!(!stage_indexed_update(
            &mut fx.ctx.contacts,
            &mut fx.ctx.writes,
            handle,
            update("222")
        ));

        assert_eq!(fx.ctx.contacts.get(handle).text(fields::PHONE), Some("111"));
        assert_eq!(fx.ctx.writes.pending_len(WritePhase::AccountsContacts), 1);
    }

    #[tokio::test]
    async fn test_parent_account_billing_street_counts_for_name_match() {
        let mut fx = Fixture::new();
        let mut account = CrmRecord::with_id(EntityKind::Account, "001000000000001AAA");
        account.set(fields::BILLING_STREET, "1 Oak Lane");
        let mut contact = CrmRecord::with_id(EntityKind::Contact, "003000000000001AAA");
        contact.set(fields::FIRST_NAME, "Jane");
        contact.set(fields::LAST_NAME, "Doe");
        contact.set(fields::ACCOUNT_ID, "001000000000001AAA");
        contact.account = Some(Box::new(account));
        fx.ctx.contacts.insert(contact);

        let (outcome, _) = fx
            .resolve(
                &[
                    ("Contact First Name", "Jane"),
                    ("Contact Last Name", "Doe"),
                    ("Account Billing Street", "1 OAK LANE"),
                ],
                Pass::First,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, ContactDecision::Matched(MatchSource::Name));
    }

    #[tokio::test]
    async fn test_second_pass_inserts_household_and_contact() {
        let mut fx = Fixture::new();
        let cells = [
            ("Contact First Name", "Jane"),
            ("Contact Last Name", "Doe"),
            ("Contact Email", "Jane@X.com"),
        ];

        let (first, _) = fx.resolve(&cells, Pass::First).await.unwrap();
        assert_eq!(first.decision, ContactDecision::Deferred);
        assert_eq!(fx.store.count(EntityKind::Account), 0);

        let (second, _) = fx.resolve(&cells, Pass::Second).await.unwrap();
        assert_eq!(second.decision, ContactDecision::Inserted);
        assert!(matches!(second.contact, Some(RecordRef::Staged { .. })));

        let accounts = fx.store.records(EntityKind::Account);
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].text(fields::NAME), Some("Doe Household"));

        fx.ctx
            .writes
            .flush(&fx.store, WritePhase::AccountsContacts)
            .await
            .unwrap();
        let contacts = fx.store.records(EntityKind::Contact);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].account_id(), accounts[0].id.as_deref());
        assert_eq!(contacts[0].text(fields::EMAIL), Some("jane@x.com"));
    }

    #[tokio::test]
    async fn test_second_pass_without_last_name_is_anonymous() {
        let mut fx = Fixture::new();
        let (outcome, _) = fx
            .resolve(&[("Contact First Name", "Pat")], Pass::Second)
            .await
            .unwrap();
        assert_eq!(outcome.decision, ContactDecision::Inserted);
        fx.ctx
            .writes
            .flush(&fx.store, WritePhase::AccountsContacts)
            .await
            .unwrap();

        let contacts = fx.store.records(EntityKind::Contact);
        assert_eq!(contacts[0].text(fields::LAST_NAME), Some(ANONYMOUS_LAST_NAME));
        let accounts = fx.store.records(EntityKind::Account);
        assert_eq!(accounts[0].text(fields::NAME), Some("Anonymous Household"));
    }

    #[tokio::test]
    async fn test_account_only_row_updates_account_by_name() {
        let mut fx = Fixture::new();
        let mut account = CrmRecord::with_id(EntityKind::Account, "001000000000001AAA");
        account.set(fields::NAME, "Acme");
        fx.ctx.accounts.insert(account);

        let (outcome, _) = fx
            .resolve(&[("Account Name", "ACME"), ("Account Phone", "555")], Pass::First)
            .await
            .unwrap();

        assert_eq!(outcome.decision, ContactDecision::AccountOnly);
        assert_eq!(outcome.account.as_ref().and_then(RecordRef::id), Some("001000000000001AAA"));
        assert_eq!(fx.ctx.writes.pending_len(WritePhase::AccountsContacts), 1);
        assert_eq!(fx.store.count(EntityKind::Account), 0);
    }

    #[tokio::test]
    async fn test_account_only_row_inserts_missing_account() {
        let mut fx = Fixture::new();
        let (outcome, _) = fx
            .resolve(
                &[("Account Name", "Acme"), ("Account Custom Region", "West")],
                Pass::First,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, ContactDecision::AccountOnly);
        let accounts = fx.store.records(EntityKind::Account);
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].text("Region"), Some("West"));
    }

    #[tokio::test]
    async fn test_row_without_lookup_key_is_a_no_op() {
        let mut fx = Fixture::new();
        let (outcome, row) = fx
            .resolve(&[("Donation Amount", "10")], Pass::First)
            .await
            .unwrap();
        assert_eq!(outcome.decision, ContactDecision::NoLookupKey);
        assert!(!row.deferred_to_second_pass);
        assert!(outcome.contact.is_none());
    }

    #[tokio::test]
    async fn test_clear_token_nulls_field_on_update() {
        let mut fx = Fixture::new();
        fx.contact(
            "003000000000001AAA",
            2020,
            &[(fields::EMAIL, "a@x.com"), (fields::MOBILE_PHONE, "555")],
        );

        fx.resolve(
            &[("Contact Email", "a@x.com"), ("Contact Mobile Phone", "CLEAR IT")],
            Pass::First,
        )
        .await
        .unwrap();

        let handle = fx.ctx.contacts.by_id("003000000000001AAA").unwrap();
        assert_eq!(fx.ctx.contacts.get(handle).text(fields::MOBILE_PHONE), None);
    }
}
