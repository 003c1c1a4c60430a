use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use batchmail_lib::config::load_configuration;
use batchmail_lib::data::DataDir;
use batchmail_lib::delivery;
use batchmail_lib::probe::Probes;
use batchmail_lib::BatchmailError;

/// Send personalized emails from a table of recipients.
#[derive(Debug, Parser)]
#[command(name = "batchmail", version)]
struct Args {
    /// Directory holding `in/tables`, `in/files` and `out/tables`
    #[arg(long, env = "KBC_DATADIR", default_value = "/data")]
    data_dir: PathBuf,

    /// Configuration file (defaults to `<data-dir>/config.json`)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deliver every message and write the result table
    Run,
    /// Run one validation check and print its result as JSON
    Probe {
        #[arg(value_enum)]
        check: ProbeKind,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProbeKind {
    TestConnection,
    ValidateSubject,
    ValidatePlaintextTemplate,
    ValidateHtmlTemplate,
    ValidateAttachments,
    ValidateConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match execute(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<BatchmailError>()
                .map_or(2, BatchmailError::exit_code);
            error!("{err:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(2))
        }
    }
}

async fn execute(args: Args) -> anyhow::Result<()> {
    let data_dir = DataDir::discover(&args.data_dir)?;
    let config_path = args.config.unwrap_or_else(|| data_dir.config_path());
    let config = load_configuration(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    match args.command {
        Command::Run => {
            let summary = delivery::run(&config, &data_dir).await?;
            info!(
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "run complete"
            );
        }
        Command::Probe { check } => {
            let probes = Probes::new(&config, &data_dir);
            let result = match check {
                ProbeKind::TestConnection => probes.test_connection().await,
                ProbeKind::ValidateSubject => probes.validate_subject(),
                ProbeKind::ValidatePlaintextTemplate => probes.validate_plaintext_template(),
                ProbeKind::ValidateHtmlTemplate => probes.validate_html_template(),
                ProbeKind::ValidateAttachments => probes.validate_attachments(),
                ProbeKind::ValidateConfig => probes.validate_config().await,
            };
            println!("{}", serde_json::to_string(&result)?);
        }
    }
    Ok(())
}
