use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;

use crm_import::crm::memory::MemorySnapshot;
use crm_import::import::read_sheet;
use crm_import::{AffiliationModel, BulkImporter, ImportConfig, ImportError, InMemoryCrm};

#[derive(Parser, Debug)]
#[command(
    name = "crm-import",
    about = "Reconcile a spreadsheet of people, households and donations into a CRM snapshot"
)]
struct Args {
    /// CSV sheet to import. The first row holds the column headers.
    #[arg(long)]
    sheet: PathBuf,

    /// JSON store snapshot. Created when it does not exist yet.
    #[arg(long)]
    store: PathBuf,

    /// Affiliation model of the store (`join` or `primary`).
    #[arg(long, default_value = "join")]
    model: AffiliationModel,

    /// Field delimiter of the sheet.
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Run the import without saving the snapshot.
    #[arg(long)]
    dry_run: bool,

    /// Write per-row results and statistics to this JSON file.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn load_store(path: &Path, model: AffiliationModel) -> Result<InMemoryCrm, ImportError> {
    if !path.exists() {
        log::info!("no snapshot at {}, starting with an empty store", path.display());
        return Ok(InMemoryCrm::new(model));
    }
    let snapshot: MemorySnapshot = serde_json::from_str(&fs::read_to_string(path)?)?;
    log::info!(
        "loaded {} records from {}",
        snapshot.records.len(),
        path.display()
    );
    Ok(InMemoryCrm::from_snapshot(snapshot, model))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    crm_import::init_logger();

    let args = Args::parse();
    if !args.delimiter.is_ascii() {
        return Err(format!("delimiter must be a single ASCII character, got {:?}", args.delimiter).into());
    }

    let store = load_store(&args.store, args.model)?;
    let rows = read_sheet(&args.sheet, args.delimiter as u8)?;
    log::info!("read {} rows from {}", rows.len(), args.sheet.display());

    let report = BulkImporter::new(&store, ImportConfig::from_env())
        .import_rows(rows)
        .await?;

    println!("{}", serde_json::to_string_pretty(&report.stats)?);

    if let Some(path) = &args.report {
        fs::write(path, serde_json::to_string_pretty(&report)?)?;
        log::info!("wrote row report to {}", path.display());
    }

    if args.dry_run {
        log::info!("dry run, snapshot not saved");
    } else {
        fs::write(&args.store, serde_json::to_string_pretty(&store.snapshot())?)?;
        log::info!("saved snapshot to {}", args.store.display());
    }

    Ok(())
}
