//! Single scan over the sheet that collects lookup keys and feature flags.
//!
//! Nothing here talks to the store. The resulting [`ImportPlan`] tells the
//! index builder which keys to bulk-fetch and tells the scheduler which phases
//! the run needs.

use crate::config::ImportConfig;
use crate::import::row::{CampaignOwner, CampaignRef, ImportRow};
use crate::models::EntityKind;
use std::collections::{BTreeMap, BTreeSet};

/// Columns starting with this prefix switch the run into campaign mode.
pub const CAMPAIGN_COLUMN_PREFIX: &str = "Campaign ";

/// Per-row feature flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowFeatures {
    pub has_account_columns: bool,
    pub has_contact_columns: bool,
    pub has_organizations: bool,
    pub has_recurring_donation: bool,
    pub has_donation: bool,
}

/// Distinct lookup keys for one entity kind.
#[derive(Debug, Clone, Default)]
pub struct LookupKeys {
    pub ids: BTreeSet<String>,
    pub names: BTreeSet<String>,
    /// ExtRef field name -> distinct values.
    pub ext_refs: BTreeMap<String, BTreeSet<String>>,
}

impl LookupKeys {
    fn add_ext_ref(&mut self, field: &str, value: &str) {
        self.ext_refs
            .entry(field.to_string())
            .or_default()
            .insert(value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.names.is_empty() && self.ext_refs.is_empty()
    }
}

/// Everything the run learned from scanning the sheet once.
#[derive(Debug, Clone, Default)]
pub struct ImportPlan {
    pub campaign_mode: bool,
    /// Distinct `<Entity> Custom <key>` keys per entity.
    pub custom_fields: BTreeMap<EntityKind, BTreeSet<String>>,
    pub accounts: LookupKeys,
    pub contacts: LookupKeys,
    pub contact_emails: BTreeSet<String>,
    pub recurring_donations: LookupKeys,
    pub donations: LookupKeys,
    pub campaigns: LookupKeys,
    /// Per-row flags, aligned with the row slice.
    pub rows: Vec<RowFeatures>,
    pub has_account_columns: bool,
    pub has_contact_columns: bool,
    pub has_organizations: bool,
    pub has_recurring_donations: bool,
    pub has_donations: bool,
    pub has_campaign_memberships: bool,
    pub has_notes: bool,
}

impl ImportPlan {
    /// Whether contact inserts must happen immediately because later work in
    /// the same run needs their ids.
    pub fn needs_contact_ids(&self) -> bool {
        self.has_organizations
            || self.has_campaign_memberships
            || self.has_notes
            || self.has_recurring_donations
            || self.has_donations
    }
}

fn row_features(row: &ImportRow, config: &ImportConfig) -> RowFeatures {
    RowFeatures {
        has_account_columns: row.has_prefix("Account "),
        has_contact_columns: row.has_prefix("Contact "),
        has_organizations: row.has_organizations(config.organization_slots),
        has_recurring_donation: row.lookup_value("Recurring Donation ID").is_some()
            || row.lookup_value("Recurring Donation Amount").is_some(),
        has_donation: row.lookup_value("Donation ID").is_some()
            || row.lookup_value("Donation Amount").is_some()
            || !row.ext_refs(EntityKind::Donation).is_empty(),
    }
}

fn collect_campaign_names(row: &ImportRow, config: &ImportConfig, keys: &mut LookupKeys) -> bool {
    let mut any = false;
    for owner in [CampaignOwner::Contact, CampaignOwner::Account] {
        for campaign in row.campaigns(owner, config.campaign_slots) {
            any = true;
            if let CampaignRef::Name(name) = campaign {
                keys.names.insert(name);
            }
        }
    }
    for column in ["Recurring Donation Campaign Name", "Donation Campaign Name"] {
        if let Some(name) = row.lookup_value(column) {
            keys.names.insert(name.to_string());
        }
    }
    any
}

/// Scan all rows once.
///
/// # Returns
/// The plan holding lookup keys, custom field keys and feature flags.
pub fn build_import_plan(rows: &[ImportRow], config: &ImportConfig) -> ImportPlan {
    let mut plan = ImportPlan {
        campaign_mode: rows.iter().any(|row| row.has_prefix(CAMPAIGN_COLUMN_PREFIX)),
        ..Default::default()
    };

    for row in rows {
        for kind in EntityKind::sheet_entities() {
            for (key, _) in row.custom_fields(kind) {
                plan.custom_fields
                    .entry(kind)
                    .or_default()
                    .insert(key.to_string());
            }
        }

        if plan.campaign_mode {
            if let Some(id) = row.lookup_value("Campaign ID") {
                plan.campaigns.ids.insert(id.to_string());
            }
            if let Some(name) = row.lookup_value("Campaign Name") {
                plan.campaigns.names.insert(name.to_string());
            }
            for ext_ref in row.ext_refs(EntityKind::Campaign) {
                plan.campaigns.add_ext_ref(&ext_ref.field, &ext_ref.value);
            }
            plan.rows.push(RowFeatures::default());
            continue;
        }

        let features = row_features(row, config);
        plan.has_account_columns |= features.has_account_columns;
        plan.has_contact_columns |= features.has_contact_columns;
        plan.has_organizations |= features.has_organizations;
        plan.has_recurring_donations |= features.has_recurring_donation;
        plan.has_donations |= features.has_donation;
        plan.has_notes |=
            row.lookup_value("Account Note").is_some() || row.lookup_value("Contact Note").is_some();
        plan.rows.push(features);

        // Accounts, including organizations referenced by affiliation columns
        if let Some(id) = row.account_id() {
            plan.accounts.ids.insert(id.to_string());
        }
        if row.account_name().is_some() || row.has_contact_lookup_key() {
            // Covers the household a second-pass insert would upsert into
            plan.accounts
                .names
                .insert(row.household_name(&config.household_suffix));
        }
        for ext_ref in row.ext_refs(EntityKind::Account) {
            plan.accounts.add_ext_ref(&ext_ref.field, &ext_ref.value);
        }
        for organization in row.organizations(config.organization_slots) {
            if let Some(id) = organization.id {
                plan.accounts.ids.insert(id);
            }
            if let Some(name) = organization.name {
                plan.accounts.names.insert(name);
            }
            for ext_ref in organization.ext_refs {
                plan.accounts.add_ext_ref(&ext_ref.field, &ext_ref.value);
            }
        }

        // Contacts
        if let Some(id) = row.contact_id() {
            plan.contacts.ids.insert(id.to_string());
        }
        if row.first_name.is_some() && row.last_name.is_some() {
            plan.contacts.names.insert(row.full_name());
        }
        plan.contact_emails.extend(row.emails.iter().cloned());
        for ext_ref in row.ext_refs(EntityKind::Contact) {
            plan.contacts.add_ext_ref(&ext_ref.field, &ext_ref.value);
        }

        // Dependent entities
        if let Some(id) = row.lookup_value("Recurring Donation ID") {
            plan.recurring_donations.ids.insert(id.to_string());
        }
        for ext_ref in row.ext_refs(EntityKind::RecurringDonation) {
            plan.recurring_donations.add_ext_ref(&ext_ref.field, &ext_ref.value);
        }
        if let Some(id) = row.lookup_value("Donation ID") {
            plan.donations.ids.insert(id.to_string());
        }
        for ext_ref in row.ext_refs(EntityKind::Donation) {
            plan.donations.add_ext_ref(&ext_ref.field, &ext_ref.value);
        }
        plan.has_campaign_memberships |= collect_campaign_names(row, config, &mut plan.campaigns);
    }

    log::debug!(
        "import plan: {} rows, campaign_mode={}, {} account keys, {} contact keys, {} emails",
        rows.len(),
        plan.campaign_mode,
        plan.accounts.ids.len() + plan.accounts.names.len(),
        plan.contacts.ids.len() + plan.contacts.names.len(),
        plan.contact_emails.len()
    );
    for (kind, keys) in &plan.custom_fields {
        log::debug!("custom {} fields: {:?}", kind, keys);
    }

    plan
}
