//! Import statistics tracking.
//!
//! Tracks what one run did to each entity kind and how rows were classified.

use crate::import::batch::BatchWriteCoordinator;
use crate::import::dependents::{DependentAction, DependentOutcome};
use crate::import::resolver::{ContactDecision, MatchSource, RowOutcome};
use crate::models::EntityKind;
use serde::{Deserialize, Serialize};

/// Statistics for a single import run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    /// Data rows read from the sheet
    pub rows: usize,
    pub accounts_inserted: usize,
    pub accounts_updated: usize,
    pub contacts_inserted: usize,
    pub contacts_updated: usize,
    /// Rows whose contact matched on `Contact ID`
    pub matched_by_id: usize,
    pub matched_by_ext_ref: usize,
    pub matched_by_email: usize,
    pub matched_by_name: usize,
    /// Rows the first pass deferred to the second
    pub deferred_rows: usize,
    pub account_only_rows: usize,
    /// Rows with no id, email or name to match on
    pub no_lookup_key_rows: usize,
    pub ambiguous_rows: usize,
    /// Rows skipped after a store error
    pub failed_rows: usize,
    /// Cells left unset because their value could not be coerced
    pub coercion_failures: usize,
    pub recurring_donations_inserted: usize,
    pub recurring_donations_updated: usize,
    pub donations_inserted: usize,
    pub donations_updated: usize,
    /// Dependent records skipped because an identical one exists
    pub duplicates_skipped: usize,
    /// Dependent records skipped because neither account nor contact resolved
    pub orphans_skipped: usize,
    pub campaigns_inserted: usize,
    pub campaigns_updated: usize,
    pub campaign_members: usize,
    pub affiliations: usize,
    pub notes: usize,
}

impl ImportStats {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn record_outcome(&mut self, outcome: &RowOutcome) {
        self.coercion_failures += outcome.coercion_failures;
        match outcome.decision {
            ContactDecision::Matched(MatchSource::Id) => self.matched_by_id += 1,
            ContactDecision::Matched(MatchSource::ExtRef) => self.matched_by_ext_ref += 1,
            ContactDecision::Matched(MatchSource::Email) => self.matched_by_email += 1,
            ContactDecision::Matched(MatchSource::Name) => self.matched_by_name += 1,
            ContactDecision::Deferred => self.deferred_rows += 1,
            ContactDecision::AccountOnly => self.account_only_rows += 1,
            ContactDecision::NoLookupKey => self.no_lookup_key_rows += 1,
            ContactDecision::Inserted => {}
        }
    }

    pub fn record_dependent(&mut self, outcome: &DependentOutcome) {
        self.coercion_failures += outcome.coercion_failures;
        match outcome.action {
            DependentAction::Duplicate => self.duplicates_skipped += 1,
            DependentAction::Orphan => self.orphans_skipped += 1,
            DependentAction::Inserted | DependentAction::Updated | DependentAction::Skipped => {}
        }
    }

    /// Copy insert/update counts from the write coordinator.
    pub fn collect_writes(&mut self, writes: &BatchWriteCoordinator) {
        let accounts = writes.counts(EntityKind::Account);
        self.accounts_inserted = accounts.inserted;
        self.accounts_updated = accounts.updated;
        let contacts = writes.counts(EntityKind::Contact);
        self.contacts_inserted = contacts.inserted;
        self.contacts_updated = contacts.updated;
        let recurring = writes.counts(EntityKind::RecurringDonation);
        self.recurring_donations_inserted = recurring.inserted;
        self.recurring_donations_updated = recurring.updated;
        let donations = writes.counts(EntityKind::Donation);
        self.donations_inserted = donations.inserted;
        self.donations_updated = donations.updated;
        let campaigns = writes.counts(EntityKind::Campaign);
        self.campaigns_inserted = campaigns.inserted;
        self.campaigns_updated = campaigns.updated;
        self.campaign_members = writes.counts(EntityKind::CampaignMember).inserted;
        self.affiliations = writes.counts(EntityKind::Affiliation).inserted
            + writes.counts(EntityKind::AccountContactRelation).inserted;
        self.notes = writes.counts(EntityKind::Note).inserted;
    }
}
