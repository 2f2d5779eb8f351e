//! Import coordination for one sheet.
//!
//! The BulkImporter drives a run end to end:
//! 1. Scan the rows into an [`ImportPlan`]
//! 2. Bulk-load the match indices
//! 3. First pass over every row
//! 4. Flush accounts/contacts (the barrier the second pass relies on)
//! 5. Second pass over deferred rows, then flush again
//! 6. Recurring donations, donations and campaign memberships, each flushed in turn
//!
//! Sheets with `Campaign ...` columns skip all of the above and run a single
//! campaign pass instead.

use crate::config::ImportConfig;
use crate::crm::CrmPort;
use crate::error::ImportError;
use crate::import::affiliation::{AffiliationStrategy, strategy_for};
use crate::import::batch::{BatchWriteCoordinator, WritePhase};
use crate::import::dependents::{DependentResolver, RowLinks};
use crate::import::indices::{MatchContext, MatchIndexBuilder};
use crate::import::jobs::{ImportJob, ImportStatus};
use crate::import::preprocess::{ImportPlan, build_import_plan};
use crate::import::resolver::{ContactDecision, Pass, RecordResolver, RowOutcome};
use crate::import::row::ImportRow;
use crate::import::stats::ImportStats;
use crate::models::{EntityKind, RecordRef};
use serde::Serialize;

/// Where one sheet row ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowReport {
    pub row: usize,
    /// `None` when the row failed or the run was in campaign mode.
    pub decision: Option<ContactDecision>,
    pub account_id: Option<String>,
    pub contact_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub stats: ImportStats,
    pub rows: Vec<RowReport>,
}

/// Coordinates one import run against a CRM store.
pub struct BulkImporter<'a> {
    port: &'a dyn CrmPort,
    config: ImportConfig,
}

impl<'a> BulkImporter<'a> {
    /// Create a new BulkImporter.
    ///
    /// # Arguments
    /// * `port` - the store rows are reconciled against
    /// * `config` - run configuration
    pub fn new(port: &'a dyn CrmPort, config: ImportConfig) -> Self {
        Self { port, config }
    }

    /// Import rows with a private job handle.
    pub async fn import_rows(&self, rows: Vec<ImportRow>) -> Result<ImportReport, ImportError> {
        self.import(rows, &ImportJob::new()).await
    }

    /// Import rows, reporting progress on `job`.
    ///
    /// # Returns
    /// Run statistics and per-row results. Row-level failures are counted,
    /// not returned; bulk lookup, flush and cancellation errors end the run.
    pub async fn import(
        &self,
        rows: Vec<ImportRow>,
        job: &ImportJob,
    ) -> Result<ImportReport, ImportError> {
        job.start_job().await.map_err(ImportError::AlreadyRunning)?;
        let result = self.run(rows, job).await;

        match &result {
            Ok(report) => {
                let final_stats = report.stats.clone();
                job.update_stats(move |s| *s = final_stats).await;
                job.complete_job().await;
            }
            Err(ImportError::Cancelled) => {
                log::warn!("import cancelled");
                job.cancel_job().await;
            }
            Err(e) => {
                log::error!("import failed: {}", e);
                job.fail_job(e.to_string()).await;
            }
        }
        result
    }

    async fn run(&self, mut rows: Vec<ImportRow>, job: &ImportJob) -> Result<ImportReport, ImportError> {
        job.update_status(ImportStatus::Preparing, "Scanning rows".to_string())
            .await;
        let plan = build_import_plan(&rows, &self.config);
        let mut stats = ImportStats::new(rows.len());

        if plan.campaign_mode {
            log::info!("campaign columns present, importing {} campaign rows", rows.len());
            return self.run_campaigns(&rows, &plan, job, stats).await;
        }

        let strategy = strategy_for(self.port.affiliation_model());
        let mut immediate = vec![EntityKind::Account, EntityKind::Note, EntityKind::Campaign];
        if plan.needs_contact_ids() {
            immediate.push(EntityKind::Contact);
        }
        log::debug!(
            "affiliation model {}, immediate contact inserts: {}",
            strategy.model(),
            plan.needs_contact_ids()
        );
        let mut ctx = MatchContext::new(&self.config, BatchWriteCoordinator::new(immediate));

        // Phase 1: Build indices
        self.build_indices(&plan, strategy.as_ref(), &mut ctx, job)
            .await?;

        // Phase 2: First pass
        let resolver = RecordResolver::new(self.port, &self.config, &plan, strategy.as_ref());
        let mut outcomes: Vec<Option<RowOutcome>> = vec![None; rows.len()];
        job.update_status(ImportStatus::FirstPass, "Matching rows".to_string())
            .await;
        let total = rows.len();
        for (i, row) in rows.iter_mut().enumerate() {
            Self::check_cancelled(job)?;
            match resolver.resolve(&mut ctx, row, plan.rows[i], Pass::First).await {
                Ok(outcome) => {
                    stats.record_outcome(&outcome);
                    if outcome.decision != ContactDecision::Deferred {
                        outcomes[i] = Some(outcome);
                    }
                }
                Err(e) => Self::row_failed(e, job, &mut stats).await?,
            }
            self.report_progress(i + 1, total, job).await;
        }

        // Phase 3: Flush barrier, so second-pass rows see first-pass inserts
        self.flush(&mut ctx, WritePhase::AccountsContacts, job).await?;

        // Phase 4: Second pass
        let deferred: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.deferred_to_second_pass)
            .map(|(i, _)| i)
            .collect();
        if !deferred.is_empty() {
            job.update_status(
                ImportStatus::SecondPass,
                format!("Inserting {} deferred rows", deferred.len()),
            )
            .await;
            for (done, &i) in deferred.iter().enumerate() {
                Self::check_cancelled(job)?;
                let row = &mut rows[i];
                match resolver.resolve(&mut ctx, row, plan.rows[i], Pass::Second).await {
                    Ok(outcome) => {
                        stats.record_outcome(&outcome);
                        outcomes[i] = Some(outcome);
                    }
                    Err(e) => Self::row_failed(e, job, &mut stats).await?,
                }
                self.report_progress(done + 1, deferred.len(), job).await;
            }
        }
        self.flush(&mut ctx, WritePhase::AccountsContacts, job).await?;

        // Phase 5: Dependent records
        let links: Vec<Option<RowLinks>> = outcomes
            .iter()
            .zip(&rows)
            .map(|(outcome, row)| outcome.as_ref().map(|o| Self::links(&ctx, row, o)))
            .collect();
        self.run_dependents(&rows, &plan, &links, &mut ctx, job, &mut stats)
            .await?;

        stats.collect_writes(&ctx.writes);
        let row_reports = rows
            .iter()
            .zip(outcomes)
            .zip(links)
            .map(|((row, outcome), links)| {
                let links = links.unwrap_or_default();
                RowReport {
                    row: row.number,
                    decision: outcome.map(|o| o.decision),
                    account_id: links.account_id,
                    contact_id: links.contact_id,
                }
            })
            .collect();
        log::info!(
            "import finished: {} rows, {} contacts inserted, {} updated, {} deferred, {} failed",
            stats.rows,
            stats.contacts_inserted,
            stats.contacts_updated,
            stats.deferred_rows,
            stats.failed_rows
        );
        Ok(ImportReport {
            stats,
            rows: row_reports,
        })
    }

    async fn build_indices(
        &self,
        plan: &ImportPlan,
        strategy: &dyn AffiliationStrategy,
        ctx: &mut MatchContext,
        job: &ImportJob,
    ) -> Result<(), ImportError> {
        Self::check_cancelled(job)?;
        job.update_status(ImportStatus::Indexing, "Loading existing records".to_string())
            .await;
        let builder = MatchIndexBuilder::new(self.port);

        builder.build_account_indices(plan, ctx).await?;
        builder.build_contact_indices(plan, ctx).await?;
        if plan.has_recurring_donations {
            builder.build_recurring_donation_index(plan, ctx).await?;
        }
        if plan.has_donations {
            builder.build_donation_index(plan, ctx).await?;
        }
        builder.build_campaign_name_index(plan, ctx).await?;
        if plan.has_organizations {
            builder.build_affiliation_seen_set(strategy, ctx).await?;
        }

        log::info!(
            "indexed {} accounts, {} contacts, {} campaigns",
            ctx.accounts.len(),
            ctx.contacts.len(),
            ctx.campaigns.len()
        );
        Ok(())
    }

    async fn run_dependents(
        &self,
        rows: &[ImportRow],
        plan: &ImportPlan,
        links: &[Option<RowLinks>],
        ctx: &mut MatchContext,
        job: &ImportJob,
        stats: &mut ImportStats,
    ) -> Result<(), ImportError> {
        let dependents = DependentResolver::new(self.port, &self.config);
        job.update_status(ImportStatus::Dependents, "Importing donations".to_string())
            .await;

        if plan.has_recurring_donations {
            for (i, row) in rows.iter().enumerate() {
                let Some(row_links) = &links[i] else {
                    continue;
                };
                if !plan.rows[i].has_recurring_donation {
                    continue;
                }
                Self::check_cancelled(job)?;
                match dependents.recurring_donation(ctx, row, row_links).await {
                    Ok(outcome) => stats.record_dependent(&outcome),
                    Err(e) => Self::row_failed(e, job, stats).await?,
                }
            }
        }
        self.flush(ctx, WritePhase::RecurringDonations, job).await?;

        if plan.has_donations {
            for (i, row) in rows.iter().enumerate() {
                let Some(row_links) = &links[i] else {
                    continue;
                };
                if !plan.rows[i].has_donation {
                    continue;
                }
                Self::check_cancelled(job)?;
                match dependents.donation(ctx, row, row_links).await {
                    Ok(outcome) => stats.record_dependent(&outcome),
                    Err(e) => Self::row_failed(e, job, stats).await?,
                }
            }
        }
        self.flush(ctx, WritePhase::Donations, job).await?;

        self.flush(ctx, WritePhase::Campaigns, job).await
    }

    /// Single pass over campaign rows.
    async fn run_campaigns(
        &self,
        rows: &[ImportRow],
        plan: &ImportPlan,
        job: &ImportJob,
        mut stats: ImportStats,
    ) -> Result<ImportReport, ImportError> {
        let mut ctx = MatchContext::new(&self.config, BatchWriteCoordinator::new([]));
        Self::check_cancelled(job)?;
        job.update_status(ImportStatus::Indexing, "Loading existing campaigns".to_string())
            .await;
        MatchIndexBuilder::new(self.port)
            .build_campaign_name_index(plan, &mut ctx)
            .await?;

        let dependents = DependentResolver::new(self.port, &self.config);
        job.update_status(ImportStatus::FirstPass, "Importing campaigns".to_string())
            .await;
        for (i, row) in rows.iter().enumerate() {
            Self::check_cancelled(job)?;
            match dependents.campaign(&mut ctx, row).await {
                Ok(outcome) => stats.record_dependent(&outcome),
                Err(e) => Self::row_failed(e, job, &mut stats).await?,
            }
            self.report_progress(i + 1, rows.len(), job).await;
        }
        self.flush(&mut ctx, WritePhase::Campaigns, job).await?;

        stats.collect_writes(&ctx.writes);
        log::info!(
            "campaign import finished: {} inserted, {} updated",
            stats.campaigns_inserted,
            stats.campaigns_updated
        );
        let row_reports = rows
            .iter()
            .map(|row| RowReport {
                row: row.number,
                decision: None,
                account_id: None,
                contact_id: None,
            })
            .collect();
        Ok(ImportReport {
            stats,
            rows: row_reports,
        })
    }

    /// Flush one phase and hand the new ids to the indices.
    async fn flush(
        &self,
        ctx: &mut MatchContext,
        phase: WritePhase,
        job: &ImportJob,
    ) -> Result<(), ImportError> {
        Self::check_cancelled(job)?;
        job.update_phase_details(format!("Flushing {}", phase)).await;
        let report = ctx.writes.flush(self.port, phase).await?;

        for (reference, id) in &report.resolved {
            if let RecordRef::Staged { kind, .. } = reference {
                if let Some(index) = ctx.index_mut(*kind) {
                    index.resolve_staged(reference, id);
                }
            }
        }
        log::info!(
            "flushed {}: {} inserted, {} updated",
            phase,
            report.inserted,
            report.updated
        );
        Ok(())
    }

    /// Store ids for a resolved row, after its inserts have been flushed.
    fn links(ctx: &MatchContext, row: &ImportRow, outcome: &RowOutcome) -> RowLinks {
        let account_id = outcome
            .account
            .as_ref()
            .and_then(|r| ctx.writes.resolve(r));
        let account_name = row.account_name().map(str::to_string).or_else(|| {
            account_id
                .as_deref()
                .and_then(|id| ctx.accounts.by_id(id))
                .map(|h| ctx.accounts.get(h).display_name())
                .filter(|name| !name.is_empty())
        });
        RowLinks {
            account_id,
            account_name,
            contact_id: outcome
                .contact
                .as_ref()
                .and_then(|r| ctx.writes.resolve(r)),
        }
    }

    fn check_cancelled(job: &ImportJob) -> Result<(), ImportError> {
        if job.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        Ok(())
    }

    /// Log and count a row-scoped error; fatal errors are passed back up.
    async fn row_failed(
        error: ImportError,
        job: &ImportJob,
        stats: &mut ImportStats,
    ) -> Result<(), ImportError> {
        if error.is_fatal() {
            return Err(error);
        }
        if let ImportError::AmbiguousMatch { .. } = error {
            log::warn!("{}, skipping row", error);
            stats.ambiguous_rows += 1;
            job.add_warning(error.to_string()).await;
        } else {
            log::error!("{}, skipping row", error);
            stats.failed_rows += 1;
            job.add_error(error.to_string()).await;
        }
        Ok(())
    }

    async fn report_progress(&self, processed: usize, total: usize, job: &ImportJob) {
        job.update_progress(processed, Some(total)).await;
        if processed % self.config.progress_log_interval.max(1) == 0 || processed == total {
            log::info!("Imported {} of {} rows", processed, total);
        }
    }
}
