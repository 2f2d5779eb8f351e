use crm_import::crm::memory::WriteOp;
use crm_import::import::{ContactDecision, ImportJob, ImportStatus, MatchSource, read_rows};
use crm_import::models::{CrmRecord, EntityKind, FieldValue, fields};
use crm_import::{
    AffiliationModel, BulkImporter, ImportConfig, ImportError, ImportReport, InMemoryCrm,
};

fn store() -> InMemoryCrm {
    InMemoryCrm::new(AffiliationModel::JoinObject)
}

async fn import(store: &InMemoryCrm, sheet: &str) -> Result<ImportReport, ImportError> {
    let rows = read_rows(sheet.as_bytes(), b',')?;
    BulkImporter::new(store, ImportConfig::from_env())
        .import_rows(rows)
        .await
}

fn seed_contact(store: &InMemoryCrm, cells: &[(&str, &str)]) -> String {
    let mut record = CrmRecord::new(EntityKind::Contact);
    for (field, value) in cells {
        record.set(*field, *value);
    }
    store.seed(record)
}

const DONORS: &str = "\
Contact First Name,Contact Last Name,Contact Email,Donation Amount,Donation Date
Jane,Doe,jane@x.com,25,2024-01-15
John,Roe,john@x.com,40,2024-02-01
";

#[tokio::test]
async fn test_rerunning_a_sheet_creates_no_new_records() {
    let store = store();

    let first = import(&store, DONORS).await.unwrap();
    assert_eq!(first.stats.contacts_inserted, 2);
    assert_eq!(first.stats.accounts_inserted, 2);
    assert_eq!(first.stats.donations_inserted, 2);
    assert_eq!(first.stats.deferred_rows, 2);

    let second = import(&store, DONORS).await.unwrap();
    assert_eq!(second.stats.contacts_inserted, 0);
    assert_eq!(second.stats.accounts_inserted, 0);
    assert_eq!(second.stats.donations_inserted, 0);
    assert_eq!(second.stats.matched_by_email, 2);
    assert_eq!(second.stats.duplicates_skipped, 2);

    assert_eq!(store.count(EntityKind::Contact), 2);
    assert_eq!(store.count(EntityKind::Account), 2);
    assert_eq!(store.count(EntityKind::Donation), 2);
    assert_eq!(first.rows[0].contact_id, second.rows[0].contact_id);
}

#[tokio::test]
async fn test_rows_sharing_an_email_share_one_contact() {
    let store = store();
    let sheet = "\
Contact First Name,Contact Last Name,Contact Email
Jane,Doe,jane@x.com
Jane,Doe,JANE@x.com
";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(store.count(EntityKind::Contact), 1);
    assert_eq!(store.count(EntityKind::Account), 1);
    assert!(report.rows[0].contact_id.is_some());
    assert_eq!(report.rows[0].contact_id, report.rows[1].contact_id);
    assert_eq!(report.rows[0].decision, Some(ContactDecision::Inserted));

    let account = &store.records(EntityKind::Account)[0];
    assert_eq!(account.text(fields::NAME), Some("Doe Household"));
}

#[tokio::test]
async fn test_deferred_inserts_follow_the_first_flush() {
    let store = store();
    let sheet = "Contact First Name,Contact Last Name,Contact Email\nJane,Doe,jane@x.com\n";

    import(&store, sheet).await.unwrap();

    let log = store.write_log();
    let first_flush = log.iter().position(|e| e.op == WriteOp::Flush).unwrap();
    let first_insert = log
        .iter()
        .position(|e| matches!(e.op, WriteOp::Insert | WriteOp::BatchInsert))
        .unwrap();
    assert!(first_flush < first_insert);
}

#[tokio::test]
async fn test_contact_id_beats_name_match() {
    let store = store();
    seed_contact(&store, &[(fields::FIRST_NAME, "Jane"), (fields::LAST_NAME, "Doe")]);
    let target = seed_contact(&store, &[(fields::FIRST_NAME, "Jane"), (fields::LAST_NAME, "Doe")]);
    let sheet = format!(
        "Contact ID,Contact First Name,Contact Last Name\n{},Jane,Doe\n",
        &target[..15]
    );

    let report = import(&store, &sheet).await.unwrap();

    assert_eq!(
        report.rows[0].decision,
        Some(ContactDecision::Matched(MatchSource::Id))
    );
    assert_eq!(report.rows[0].contact_id.as_deref(), Some(target.as_str()));
    assert_eq!(store.count(EntityKind::Contact), 2);
}

#[tokio::test]
async fn test_ext_ref_beats_email() {
    let store = store();
    let by_ref = seed_contact(&store, &[(fields::LAST_NAME, "Doe"), ("SourceId", "77")]);
    seed_contact(&store, &[(fields::LAST_NAME, "Roe"), (fields::EMAIL, "a@x.com")]);
    let sheet = "Contact ExtRef SourceId,Contact Email\n77,a@x.com\n";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(report.stats.matched_by_ext_ref, 1);
    assert_eq!(report.rows[0].contact_id.as_deref(), Some(by_ref.as_str()));
}

#[tokio::test]
async fn test_shared_ext_ref_skips_the_row() {
    let store = store();
    seed_contact(&store, &[(fields::LAST_NAME, "Doe"), ("SourceId", "77")]);
    seed_contact(&store, &[(fields::LAST_NAME, "Roe"), ("SourceId", "77")]);
    let sheet = "Contact ExtRef SourceId,Contact Email\n77,a@x.com\n";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(report.stats.ambiguous_rows, 1);
    assert_eq!(report.rows[0].decision, None);
    assert_eq!(store.count(EntityKind::Contact), 2);
}

#[tokio::test]
async fn test_name_match_without_address_on_file() {
    let store = store();
    let jane = seed_contact(&store, &[(fields::FIRST_NAME, "Jane"), (fields::LAST_NAME, "Doe")]);
    let sheet = "Contact First Name,Contact Last Name,Contact Mailing Street\nJane,Doe,1 Main St\n";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(report.stats.matched_by_name, 1);
    assert_eq!(report.rows[0].contact_id.as_deref(), Some(jane.as_str()));
    let stored = store.get(EntityKind::Contact, &jane).unwrap();
    assert_eq!(stored.text(fields::MAILING_STREET), Some("1 Main St"));
}

#[tokio::test]
async fn test_name_match_with_different_street_inserts_new_contact() {
    let store = store();
    seed_contact(
        &store,
        &[
            (fields::FIRST_NAME, "Jane"),
            (fields::LAST_NAME, "Doe"),
            (fields::MAILING_STREET, "9 Elm Rd"),
        ],
    );
    let sheet = "Contact First Name,Contact Last Name,Contact Mailing Street\nJane,Doe,1 Main St\n";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(report.stats.deferred_rows, 1);
    assert_eq!(report.rows[0].decision, Some(ContactDecision::Inserted));
    assert_eq!(store.count(EntityKind::Contact), 2);
}

#[tokio::test]
async fn test_contact_without_last_name_is_anonymous() {
    let store = store();

    import(&store, "Contact Email\nanon@x.com\n").await.unwrap();

    let contacts = store.records(EntityKind::Contact);
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].text(fields::LAST_NAME), Some("Anonymous"));
    let accounts = store.records(EntityKind::Account);
    assert_eq!(accounts[0].text(fields::NAME), Some("Anonymous Household"));
}

const ORGANIZATIONS: &str = "\
Contact First Name,Contact Last Name,Contact Email,Organization 1 Name,Organization 1 Role
Jane,Doe,jane@x.com,Acme,Board Member
";

#[tokio::test]
async fn test_join_model_affiliates_once_across_runs() {
    let store = store();

    let first = import(&store, ORGANIZATIONS).await.unwrap();
    import(&store, ORGANIZATIONS).await.unwrap();

    assert_eq!(first.stats.affiliations, 1);
    assert_eq!(store.count(EntityKind::Affiliation), 1);
    // Household plus the organization
    assert_eq!(store.count(EntityKind::Account), 2);

    let affiliation = &store.records(EntityKind::Affiliation)[0];
    assert_eq!(
        affiliation.text(fields::CONTACT_ID),
        first.rows[0].contact_id.as_deref()
    );
    assert_eq!(affiliation.text(fields::ROLE), Some("Board Member"));
}

#[tokio::test]
async fn test_primary_model_creates_one_relation() {
    let store = InMemoryCrm::new(AffiliationModel::PrimaryAccount);

    import(&store, ORGANIZATIONS).await.unwrap();
    import(&store, ORGANIZATIONS).await.unwrap();

    assert_eq!(store.count(EntityKind::Affiliation), 0);
    let relations = store.records(EntityKind::AccountContactRelation);
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].text(fields::ROLE), Some("Board Member"));
    assert_eq!(relations[0].fields.get(fields::IS_ACTIVE), Some(&FieldValue::Bool(true)));
}

#[tokio::test]
async fn test_campaign_mode_updates_by_name_and_dedupes() {
    let store = store();
    let mut spring = CrmRecord::new(EntityKind::Campaign);
    spring.set(fields::NAME, "Spring Appeal");
    let spring_id = store.seed(spring);
    let sheet = "\
Campaign Name,Campaign Status
Spring Appeal,Active
Gala,Planned
gala,Planned
";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(report.stats.campaigns_updated, 1);
    assert_eq!(report.stats.campaigns_inserted, 1);
    assert_eq!(report.stats.duplicates_skipped, 1);
    assert_eq!(store.count(EntityKind::Campaign), 2);
    assert_eq!(store.count(EntityKind::Contact), 0);
    let spring = store.get(EntityKind::Campaign, &spring_id).unwrap();
    assert_eq!(spring.text(fields::STATUS), Some("Active"));
}

#[tokio::test]
async fn test_donation_without_account_or_contact_is_skipped() {
    let store = store();

    let report = import(&store, "Donation Amount\n25\n").await.unwrap();

    assert_eq!(report.stats.no_lookup_key_rows, 1);
    assert_eq!(report.stats.orphans_skipped, 1);
    assert_eq!(store.count(EntityKind::Donation), 0);
}

#[tokio::test]
async fn test_identical_donations_in_one_sheet_insert_once_unless_forced() {
    let store = store();
    let sheet = "\
Contact Last Name,Contact Email,Donation Amount,Donation Date
Doe,jane@x.com,25,2024-01-15
Doe,jane@x.com,25,2024-01-15
";
    let report = import(&store, sheet).await.unwrap();
    assert_eq!(report.stats.donations_inserted, 1);
    assert_eq!(report.stats.duplicates_skipped, 1);

    let forced = "\
Contact Last Name,Contact Email,Donation Amount,Donation Date,Donation Skip Duplicate Check
Doe,jane@x.com,25,2024-01-15,yes
";
    let report = import(&store, forced).await.unwrap();
    assert_eq!(report.stats.donations_inserted, 1);
    assert_eq!(store.count(EntityKind::Donation), 2);
}

#[tokio::test]
async fn test_unparseable_cells_are_counted_and_left_unset() {
    let store = store();
    let sheet = "\
Contact Last Name,Contact Email,Donation Amount,Donation Date
Doe,jane@x.com,\"$1,250.50\",someday
";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(report.stats.coercion_failures, 1);
    let donations = store.records(EntityKind::Donation);
    assert_eq!(donations.len(), 1);
    assert_eq!(donations[0].fields.get(fields::AMOUNT), Some(&FieldValue::Number(1250.5)));
    // Close date falls back to today
    assert!(donations[0].fields.get(fields::CLOSE_DATE).is_some());
}

#[tokio::test]
async fn test_recurring_donation_links_to_household() {
    let store = store();
    let sheet = "\
Contact First Name,Contact Last Name,Contact Email,Recurring Donation Amount,Recurring Donation Interval
Jane,Doe,jane@x.com,10,quarterly
";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(report.stats.recurring_donations_inserted, 1);
    let recurring = &store.records(EntityKind::RecurringDonation)[0];
    assert_eq!(
        recurring.text(fields::ACCOUNT_ID),
        report.rows[0].account_id.as_deref()
    );
    assert_eq!(recurring.text(fields::INSTALLMENT_PERIOD), Some("Quarterly"));
}

#[tokio::test]
async fn test_flush_failure_aborts_the_run() {
    let store = store();
    store.fail_flushes(true);
    let job = ImportJob::new();
    let rows = read_rows(
        "Contact Last Name,Contact Email\nDoe,jane@x.com\n".as_bytes(),
        b',',
    )
    .unwrap();

    let result = BulkImporter::new(&store, ImportConfig::from_env())
        .import(rows, &job)
        .await;

    assert!(matches!(result, Err(ImportError::Flush { .. })));
    let state = job.get_state().await;
    assert_eq!(state.status, ImportStatus::Error);
    assert!(state.error_message.is_some());
    assert_eq!(store.count(EntityKind::Contact), 0);
}

#[tokio::test]
async fn test_lookup_failure_aborts_before_any_write() {
    let store = store();
    store.fail_lookups(true);

    let result = import(&store, "Contact Last Name,Contact Email\nDoe,jane@x.com\n").await;

    assert!(matches!(result, Err(ImportError::BulkLookup { .. })));
    assert!(store.write_log().is_empty());
}

#[tokio::test]
async fn test_cancelled_job_stops_before_indexing() {
    let store = store();
    let job = ImportJob::new();
    job.cancellation_token.cancel();
    let rows = read_rows(DONORS.as_bytes(), b',').unwrap();

    let result = BulkImporter::new(&store, ImportConfig::from_env())
        .import(rows, &job)
        .await;

    assert!(matches!(result, Err(ImportError::Cancelled)));
    assert_eq!(job.get_state().await.status, ImportStatus::Cancelled);
    assert!(store.write_log().is_empty());
}

#[tokio::test]
async fn test_account_only_rows_upsert_by_name() {
    let store = store();
    let mut acme = CrmRecord::new(EntityKind::Account);
    acme.set(fields::NAME, "Acme");
    let acme_id = store.seed(acme);
    let sheet = "\
Account Name,Account Phone
Acme,555-0100
Globex,555-0199
";

    let report = import(&store, sheet).await.unwrap();

    assert_eq!(report.stats.account_only_rows, 2);
    assert_eq!(report.stats.accounts_inserted, 1);
    assert_eq!(report.stats.accounts_updated, 1);
    assert_eq!(report.rows[0].account_id.as_deref(), Some(acme_id.as_str()));
    let acme = store.get(EntityKind::Account, &acme_id).unwrap();
    assert_eq!(acme.text(fields::PHONE), Some("555-0100"));
}

#[tokio::test]
async fn test_second_pass_reuses_existing_household() {
    let store = store();
    let mut household = CrmRecord::new(EntityKind::Account);
    household.set(fields::NAME, "Doe Household");
    let household_id = store.seed(household);

    let report = import(&store, "Contact First Name,Contact Last Name,Contact Email\nJane,Doe,jane@x.com\n")
        .await
        .unwrap();

    assert_eq!(report.stats.accounts_inserted, 0);
    assert_eq!(store.count(EntityKind::Account), 1);
    let contact = &store.records(EntityKind::Contact)[0];
    assert_eq!(contact.account_id(), Some(household_id.as_str()));
}

#[tokio::test]
async fn test_name_only_row_inserts_instead_of_merging() {
    let store = store();
    let jane = seed_contact(&store, &[(fields::FIRST_NAME, "Jane"), (fields::LAST_NAME, "Doe")]);

    let report = import(&store, "Contact First Name,Contact Last Name\nJane,Doe\n")
        .await
        .unwrap();

    assert_eq!(report.stats.matched_by_name, 0);
    assert_eq!(report.rows[0].decision, Some(ContactDecision::Inserted));
    assert_ne!(report.rows[0].contact_id.as_deref(), Some(jane.as_str()));
    assert_eq!(store.count(EntityKind::Contact), 2);
}
