use tracing::{info, warn};

use super::{Orchestrator, RunSummary};
use crate::config::{Configuration, RecipientsConfig};
use crate::data::{AddressListRows, CsvOptions, DataDir, RowSource, TableRows};
use crate::ledger::ResultLedger;
use crate::transport::build_transport;

/// The recipient rows named by the configuration.
pub fn open_rows(config: &Configuration, data_dir: &DataDir) -> crate::Result<Box<dyn RowSource>> {
    match &config.recipients {
        RecipientsConfig::Table { .. } => {
            let path = data_dir.input_table(config.input_table.as_deref())?;
            info!(table = %path.display(), "reading recipients from table");
            Ok(Box::new(TableRows::open(path, &CsvOptions::default())?))
        }
        RecipientsConfig::AddressList { addresses } => Ok(Box::new(AddressListRows::new(
            addresses,
            config.recipients.column(),
        ))),
    }
}

/// A full delivery run over `data_dir`.
///
/// The ledger is created before anything else so that it exists even when
/// setup fails.
pub async fn run(config: &Configuration, data_dir: &DataDir) -> crate::Result<RunSummary> {
    let results_path = data_dir.results_path()?;
    let mut ledger = ResultLedger::create(&results_path)?;
    info!(
        data_dir = %data_dir.root().display(),
        html = config.uses_html(),
        dry_run = config.dry_run,
        "starting delivery run"
    );

    let orchestrator = Orchestrator::prepare(config, data_dir)?;
    let mut rows = open_rows(config, data_dir)?;
    let mut transport = build_transport(&config.connection, &config.overrides)?;

    let summary = orchestrator
        .deliver(rows.as_mut(), transport.as_mut(), &mut ledger)
        .await?;
    if ledger.any_failed() {
        warn!(
            failed = summary.failed,
            ledger = %results_path.display(),
            "some messages were not delivered"
        );
    }
    Ok(summary)
}
