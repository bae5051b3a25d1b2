use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use prometheus::Registry;

use mail_exporter::auth::credential_store::CredentialStore;
use mail_exporter::auth::oauth::GoogleAuthorizer;
use mail_exporter::auth::token_store;
use mail_exporter::config::{ExporterConfig, Settings};
use mail_exporter::daemon::{EngineState, PollingEngine};
use mail_exporter::domain::template;
use mail_exporter::mail::gmail::GmailClient;
use mail_exporter::mail::query::QueryBuilder;
use mail_exporter::metrics::{ExporterMetrics, MetricsServer};
use mail_exporter::parser::RegexGaugeParser;

#[derive(Parser)]
#[command(name = "mail_exporter")]
#[command(about = "Exports values found in Gmail messages as Prometheus metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Command>,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the mailbox and serve /metrics (the default)
    Run,

    /// Store the OAuth client secret in keyring
    SetClientSecret {
        #[arg(long)]
        client_id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.settings.log_level.as_deref());

    let outcome = match cli.cmd {
        Some(Command::SetClientSecret { client_id }) => set_client_secret(&client_id),
        Some(Command::Run) | None => run(cli.settings),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `EMAIL_EXPORTER_LOG_LEVEL` wins over `RUST_LOG`, which wins over `info`.
fn init_logging(level: Option<&str>) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.init();
}

fn set_client_secret(client_id: &str) -> Result<()> {
    eprintln!("Paste client secret (end with Ctrl-D):");
    let mut secret = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut secret)?;
    token_store::save_client_secret(client_id, secret.trim())?;
    println!("Saved client secret for client_id {client_id}");
    Ok(())
}

fn run(settings: Settings) -> Result<()> {
    let config = ExporterConfig::try_from(settings).context("Configuration error")?;

    let templates = template::load(&config.mappings_file, &config.schema_file)?;
    info!(
        "Loaded {} template(s) from '{}'",
        templates.len(),
        config.mappings_file.display()
    );

    let store = CredentialStore::new(
        &config.token_file,
        GoogleAuthorizer::new(&config.credentials_file, config.redirect_uri.clone()),
        config.interactive_auth,
    );
    let credential = store.ensure_valid(store.load()?)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("Received stop signal, finishing the current cycle");
            running.store(false, Ordering::SeqCst);
        })
        .context("Failed to install signal handler")?;
    }

    let registry = Registry::new();
    let metrics = ExporterMetrics::register(&registry)?;
    let server = MetricsServer::start(config.metrics_port, registry.clone())?;

    let provider = GmailClient::new(config.api_base.clone(), config.user_id.clone());
    let mut parser = RegexGaugeParser::new(registry);
    let outcome = PollingEngine::new(
        &config.poll,
        &config.fetch,
        QueryBuilder::new(config.lookback_days),
        &provider,
        &store,
        &mut parser,
        metrics,
    )
    .run(EngineState::new(credential, templates), &running);

    server.shutdown();
    outcome?;
    info!("Bye");
    Ok(())
}
