pub mod config;
pub mod crm;
pub mod error;
pub mod import;
pub mod models;

pub use config::ImportConfig;
pub use crm::{AffiliationModel, CrmError, CrmPort, InMemoryCrm};
pub use error::ImportError;
pub use import::{BulkImporter, ImportReport, ImportRow, ImportStats};

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the process logger once. Later calls are no-ops.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .init();
    });
}
