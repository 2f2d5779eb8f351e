//! Bulk import of spreadsheet rows into a CRM store.
//!
//! Each row may describe an account, a contact, a recurring donation, a
//! donation, campaign memberships, notes and up to a configured number of
//! organization affiliations. The engine reconciles rows against existing
//! store data instead of blindly inserting.
//!
//! ## Data Flow
//!
//! 1. **Read**: `sheet` turns a CSV file into [`ImportRow`]s
//! 2. **Plan**: `preprocess` scans every row once and collects lookup keys
//! 3. **Index**: `indices` bulk-loads candidate records, one query per key type
//! 4. **Resolve**: `resolver` walks the match priority for each row and stages writes
//! 5. **Flush**: `batch` applies staged writes per phase and resolves placeholder ids
//! 6. **Dependents**: `dependents` links donations and recurring donations to the
//!    records the earlier phases produced
//!
//! Rows that can only be matched once first-pass inserts are visible are
//! deferred and retried after the accounts/contacts flush.
//!
//! ```rust,ignore
//! let store = InMemoryCrm::new(AffiliationModel::JoinObject);
//! let rows = read_sheet(Path::new("contacts.csv"), b',')?;
//! let report = BulkImporter::new(&store, ImportConfig::from_env())
//!     .import_rows(rows)
//!     .await?;
//! println!("{} contacts inserted", report.stats.contacts_inserted);
//! ```

pub mod affiliation;
pub mod batch;
pub mod coercion;
pub mod coordinator;
pub mod dependents;
pub mod indices;
pub mod jobs;
pub mod preprocess;
pub mod resolver;
pub mod row;
pub mod sheet;
pub mod stats;

pub use coordinator::{BulkImporter, ImportReport, RowReport};
pub use jobs::{ImportJob, ImportJobState, ImportStatus};
pub use resolver::{ContactDecision, MatchSource};
pub use row::ImportRow;
pub use sheet::{read_rows, read_sheet};
pub use stats::ImportStats;
