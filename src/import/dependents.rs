//! Recurring donations, donations and campaign-mode rows.
//!
//! These run after the account/contact passes, one phase per entity kind, and
//! only read the account and contact ids those passes resolved.

use crate::config::ImportConfig;
use crate::crm::{CrmError, CrmPort, CrmQuery};
use crate::error::ImportError;
use crate::import::coercion::apply_custom_fields;
use crate::import::indices::{MatchContext, RecordHandle, RecordIndex};
use crate::import::resolver::{
    copy_cell, ensure_campaign, find_by_ext_refs, index_staged, row_failed, stage_indexed_update,
};
use crate::import::row::{ANONYMOUS_LAST_NAME, ImportRow};
use crate::models::{CrmRecord, EntityKind, FieldValue, fields};
use chrono::Utc;

/// Store ids a row resolved to in the account/contact passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowLinks {
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub contact_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentAction {
    Inserted,
    Updated,
    /// Already staged this run, or already in the store.
    Duplicate,
    /// Neither an account nor a contact resolved, so nothing to attach to.
    Orphan,
    /// Not enough data on the row to act.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependentOutcome {
    pub action: DependentAction,
    pub coercion_failures: usize,
}

impl DependentOutcome {
    fn new(action: DependentAction, coercion_failures: usize) -> Self {
        Self {
            action,
            coercion_failures,
        }
    }
}

/// Store value for a `Recurring Donation Interval` cell. Unknown values fall back to monthly.
pub fn installment_period(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return "Monthly";
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "weekly" => "Weekly",
        "monthly" => "Monthly",
        "quarterly" => "Quarterly",
        "biannually" | "semiannually" | "semi-annually" => "Biannually",
        "yearly" | "annually" | "annual" => "Yearly",
        other => {
            log::warn!("unknown recurring donation interval '{}', using monthly", other);
            "Monthly"
        }
    }
}

fn truncate(value: &str, max_len: usize) -> String {
    value.chars().take(max_len).collect()
}

/// Existing record by `<prefix> ID`, then ExtRef columns.
fn find_existing(
    index: &RecordIndex,
    row: &ImportRow,
    id_column: &str,
) -> Result<Option<RecordHandle>, ImportError> {
    if let Some(id) = row.lookup_value(id_column) {
        match index.by_id(id) {
            Some(handle) => return Ok(Some(handle)),
            None => log::warn!("row {}: {} '{}' not found, inserting", row.number, id_column, id),
        }
    }
    find_by_ext_refs(index, &row.ext_refs(index.kind()), row.number)
}

pub struct DependentResolver<'a> {
    port: &'a dyn CrmPort,
    config: &'a ImportConfig,
}

impl<'a> DependentResolver<'a> {
    pub fn new(port: &'a dyn CrmPort, config: &'a ImportConfig) -> Self {
        Self { port, config }
    }

    /// Name used for generated record names: the contact, else the account.
    fn donor_name(row: &ImportRow, links: &RowLinks) -> String {
        let full_name = row.full_name();
        if !full_name.is_empty() {
            return full_name;
        }
        links
            .account_name
            .clone()
            .unwrap_or_else(|| ANONYMOUS_LAST_NAME.to_string())
    }

    async fn campaign_id(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        prefix: &str,
    ) -> Result<Option<String>, ImportError> {
        if let Some(id) = row.lookup_value(&format!("{} Campaign ID", prefix)) {
            return Ok(Some(id.to_string()));
        }
        match row.lookup_value(&format!("{} Campaign Name", prefix)) {
            Some(name) => ensure_campaign(self.port, ctx, name)
                .await
                .map_err(row_failed(row.number)),
            None => Ok(None),
        }
    }

    fn set_amount(&self, row: &ImportRow, record: &mut CrmRecord, column: &str) -> usize {
        match row.amount(column) {
            Some(Ok(amount)) => {
                record.set(fields::AMOUNT, amount);
                0
            }
            Some(Err(raw)) => {
                log::warn!("row {}: could not parse amount '{}' in {}", row.number, raw, column);
                1
            }
            None => 0,
        }
    }

    fn set_date(&self, row: &ImportRow, record: &mut CrmRecord, column: &str, field: &str) -> usize {
        match row.date(column) {
            Some(Ok(date)) => {
                record.set(field, date);
                0
            }
            Some(Err(raw)) => {
                log::warn!("row {}: could not parse date '{}' in {}", row.number, raw, column);
                1
            }
            None => 0,
        }
    }

    /// Update or insert the row's recurring donation.
    pub async fn recurring_donation(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        links: &RowLinks,
    ) -> Result<DependentOutcome, ImportError> {
        let existing = find_existing(&ctx.recurring_donations, row, "Recurring Donation ID")?;

        let mut record = CrmRecord::new(EntityKind::RecurringDonation);
        let mut failures = self.set_amount(row, &mut record, "Recurring Donation Amount");
        failures += self.set_date(row, &mut record, "Recurring Donation Start Date", fields::DATE_ESTABLISHED);
        failures += self.set_date(
            row,
            &mut record,
            "Recurring Donation Next Payment Date",
            fields::NEXT_PAYMENT_DATE,
        );
        copy_cell(row, &mut record, "Recurring Donation Status", fields::STATUS);
        copy_cell(row, &mut record, "Recurring Donation Name", fields::NAME);
        copy_cell(row, &mut record, "Recurring Donation Owner ID", fields::OWNER_ID);
        if let Some(interval) = row.lookup_value("Recurring Donation Interval") {
            record.set(fields::INSTALLMENT_PERIOD, installment_period(Some(interval)));
        }
        if let Some(campaign_id) = self.campaign_id(ctx, row, "Recurring Donation").await? {
            record.set(fields::CAMPAIGN_ID, campaign_id);
        }
        for ext_ref in row.ext_refs(EntityKind::RecurringDonation) {
            record.set(ext_ref.field, ext_ref.value);
        }

        if let Some(handle) = existing {
            let Some(id) = ctx.recurring_donations.get(handle).id.clone() else {
                return Ok(DependentOutcome::new(DependentAction::Duplicate, failures));
            };
            record.id = Some(id);
            failures += apply_custom_fields(
                &mut record,
                Some(ctx.recurring_donations.get(handle)),
                row.custom_fields(EntityKind::RecurringDonation),
                row.number,
            );
            stage_indexed_update(&mut ctx.recurring_donations, &mut ctx.writes, handle, record);
            return Ok(DependentOutcome::new(DependentAction::Updated, failures));
        }

        if links.account_id.is_none() && links.contact_id.is_none() {
            log::warn!("row {}: recurring donation has no account or contact, skipping", row.number);
            return Ok(DependentOutcome::new(DependentAction::Orphan, failures));
        }

        match (&links.contact_id, &links.account_id) {
            (Some(contact_id), _) if self.config.enhanced_recurring_donations => {
                record.set(fields::CONTACT_ID, contact_id.as_str());
            }
            (_, Some(account_id)) => record.set(fields::ACCOUNT_ID, account_id.as_str()),
            (Some(contact_id), None) => record.set(fields::CONTACT_ID, contact_id.as_str()),
            (None, None) => {}
        }
        if !record.fields.contains(fields::NAME) {
            record.set(
                fields::NAME,
                format!("{} Recurring Donation", Self::donor_name(row, links)),
            );
        }
        if !record.fields.contains(fields::INSTALLMENT_PERIOD) {
            record.set(fields::INSTALLMENT_PERIOD, installment_period(None));
        }
        failures += apply_custom_fields(
            &mut record,
            None,
            row.custom_fields(EntityKind::RecurringDonation),
            row.number,
        );
        record.fields_to_null.clear();

        let key = format!(
            "{}|{}|{}|{}",
            links.account_id.as_deref().unwrap_or_default(),
            links.contact_id.as_deref().unwrap_or_default(),
            record.fields.get(fields::AMOUNT).map(FieldValue::to_string).unwrap_or_default(),
            record
                .fields
                .get(fields::DATE_ESTABLISHED)
                .map(FieldValue::to_string)
                .unwrap_or_default(),
        );
        let staged = ctx
            .writes
            .stage_insert(self.port, Some(key), record.clone())
            .await
            .map_err(row_failed(row.number))?;
        let action = if staged.is_new() {
            DependentAction::Inserted
        } else {
            DependentAction::Duplicate
        };
        index_staged(&mut ctx.recurring_donations, staged, record);
        Ok(DependentOutcome::new(action, failures))
    }

    /// Update or insert the row's donation, with the store-side duplicate check.
    pub async fn donation(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
        links: &RowLinks,
    ) -> Result<DependentOutcome, ImportError> {
        let existing = find_existing(&ctx.donations, row, "Donation ID")?;

        let mut record = CrmRecord::new(EntityKind::Donation);
        let mut failures = self.set_amount(row, &mut record, "Donation Amount");
        failures += self.set_date(row, &mut record, "Donation Date", fields::CLOSE_DATE);
        if let Some(name) = row.lookup_value("Donation Name") {
            record.set(fields::NAME, truncate(name, self.config.donation_name_max_len));
        }
        copy_cell(row, &mut record, "Donation Description", fields::DESCRIPTION);
        copy_cell(row, &mut record, "Donation Stage Name", fields::STAGE_NAME);
        copy_cell(row, &mut record, "Donation Source", fields::LEAD_SOURCE);
        copy_cell(row, &mut record, "Donation Owner ID", fields::OWNER_ID);
        copy_cell(row, &mut record, "Donation Record Type ID", fields::RECORD_TYPE_ID);
        if let Some(campaign_id) = self.campaign_id(ctx, row, "Donation").await? {
            record.set(fields::CAMPAIGN_ID, campaign_id);
        }
        for ext_ref in row.ext_refs(EntityKind::Donation) {
            record.set(ext_ref.field, ext_ref.value);
        }

        if let Some(handle) = existing {
            let Some(id) = ctx.donations.get(handle).id.clone() else {
                return Ok(DependentOutcome::new(DependentAction::Duplicate, failures));
            };
            record.id = Some(id);
            failures += apply_custom_fields(
                &mut record,
                Some(ctx.donations.get(handle)),
                row.custom_fields(EntityKind::Donation),
                row.number,
            );
            stage_indexed_update(&mut ctx.donations, &mut ctx.writes, handle, record);
            return Ok(DependentOutcome::new(DependentAction::Updated, failures));
        }

        if links.account_id.is_none() && links.contact_id.is_none() {
            log::warn!("row {}: donation has no account or contact, skipping", row.number);
            return Ok(DependentOutcome::new(DependentAction::Orphan, failures));
        }

        if let Some(account_id) = &links.account_id {
            record.set(fields::ACCOUNT_ID, account_id.as_str());
        }
        if let Some(contact_id) = &links.contact_id {
            record.set(fields::CONTACT_ID, contact_id.as_str());
        }
        if !record.fields.contains(fields::NAME) {
            let name = format!("{} Donation", Self::donor_name(row, links));
            record.set(fields::NAME, truncate(&name, self.config.donation_name_max_len));
        }
        if !record.fields.contains(fields::STAGE_NAME) {
            record.set(fields::STAGE_NAME, self.config.default_stage_name.as_str());
        }
        if !record.fields.contains(fields::CLOSE_DATE) {
            record.set(fields::CLOSE_DATE, Utc::now().date_naive());
        }
        failures += apply_custom_fields(
            &mut record,
            None,
            row.custom_fields(EntityKind::Donation),
            row.number,
        );
        record.fields_to_null.clear();

        let skip_duplicate_check = row.is_truthy("Donation Skip Duplicate Check");
        let key = if skip_duplicate_check {
            None
        } else {
            if self.exists_in_store(&record).await.map_err(row_failed(row.number))? {
                log::info!("row {}: matching donation already exists, skipping", row.number);
                return Ok(DependentOutcome::new(DependentAction::Duplicate, failures));
            }
            Some(
                [fields::ACCOUNT_ID, fields::CONTACT_ID, fields::CLOSE_DATE, fields::AMOUNT]
                    .iter()
                    .map(|field| record.fields.get(field).map(FieldValue::to_string).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("|"),
            )
        };

        let staged = ctx
            .writes
            .stage_insert(self.port, key, record.clone())
            .await
            .map_err(row_failed(row.number))?;
        let action = if staged.is_new() {
            DependentAction::Inserted
        } else {
            DependentAction::Duplicate
        };
        index_staged(&mut ctx.donations, staged, record);
        Ok(DependentOutcome::new(action, failures))
    }

    /// Whether the store already holds a donation with the same parties, date and amount.
    async fn exists_in_store(&self, record: &CrmRecord) -> Result<bool, CrmError> {
        let mut query = CrmQuery::new(EntityKind::Donation);
        for field in [fields::ACCOUNT_ID, fields::CONTACT_ID, fields::CLOSE_DATE, fields::AMOUNT] {
            if let Some(value) = record.fields.get(field) {
                query = query.filter(field, value.clone());
            }
        }
        Ok(self.port.query_single(&query).await?.is_some())
    }

    /// Campaign-mode row: update by id, ExtRef or name, insert otherwise.
    pub async fn campaign(
        &self,
        ctx: &mut MatchContext,
        row: &ImportRow,
    ) -> Result<DependentOutcome, ImportError> {
        let mut existing = find_existing(&ctx.campaigns, row, "Campaign ID")?;
        let name = row.lookup_value("Campaign Name");
        if existing.is_none() {
            existing = name.and_then(|name| ctx.campaigns.earliest(ctx.campaigns.by_name(name)));
        }

        let mut record = CrmRecord::new(EntityKind::Campaign);
        if let Some(name) = name {
            record.set(fields::NAME, name);
        }
        copy_cell(row, &mut record, "Campaign Description", fields::DESCRIPTION);
        copy_cell(row, &mut record, "Campaign Status", fields::STATUS);
        copy_cell(row, &mut record, "Campaign Type", fields::TYPE);
        copy_cell(row, &mut record, "Campaign Record Type ID", fields::RECORD_TYPE_ID);
        for ext_ref in row.ext_refs(EntityKind::Campaign) {
            record.set(ext_ref.field, ext_ref.value);
        }

        if let Some(handle) = existing {
            let Some(id) = ctx.campaigns.get(handle).id.clone() else {
                return Ok(DependentOutcome::new(DependentAction::Duplicate, 0));
            };
            record.id = Some(id);
            let failures = apply_custom_fields(
                &mut record,
                Some(ctx.campaigns.get(handle)),
                row.custom_fields(EntityKind::Campaign),
                row.number,
            );
            stage_indexed_update(&mut ctx.campaigns, &mut ctx.writes, handle, record);
            return Ok(DependentOutcome::new(DependentAction::Updated, failures));
        }

        let Some(name) = name else {
            log::warn!("row {}: campaign row has no id match and no name, skipping", row.number);
            return Ok(DependentOutcome::new(DependentAction::Skipped, 0));
        };
        let failures = apply_custom_fields(
            &mut record,
            None,
            row.custom_fields(EntityKind::Campaign),
            row.number,
        );
        record.fields_to_null.clear();
        let staged = ctx
            .writes
            .stage_insert(self.port, Some(name.to_lowercase()), record.clone())
            .await
            .map_err(row_failed(row.number))?;
        let action = if staged.is_new() {
            DependentAction::Inserted
        } else {
            DependentAction::Duplicate
        };
        index_staged(&mut ctx.campaigns, staged, record);
        Ok(DependentOutcome::new(action, failures))
    }
}
