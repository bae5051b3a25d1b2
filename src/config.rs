use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::builder::BoolishValueParser;

use crate::daemon::PollSettings;
use crate::error::ConfigError;
use crate::mail::fetcher::FetchSettings;
use crate::mail::gmail::GMAIL_API_BASE;
use crate::mail::query::{PollWindow, parse_date};

/// Raw settings, each readable from the environment or a flag.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// env_logger filter, e.g. `info` or `mail_exporter=debug`; `RUST_LOG` (then `info`) when unset
    #[arg(long, env = "EMAIL_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Seconds between steady-state cycles; also the max age of dispatched messages
    #[arg(long, env = "EMAIL_EXPORTER_PERIOD_SECONDS", default_value_t = 30)]
    pub period: u64,

    /// Seconds to wait between result pages
    #[arg(long, env = "EMAIL_EXPORTER_INTERVAL_SECONDS", default_value_t = 1)]
    pub interval: u64,

    #[arg(long, env = "EMAIL_EXPORTER_GMAIL_RESULTS_PER_PAGE", default_value_t = 100)]
    pub results_per_page: u32,

    #[arg(long, env = "EMAIL_EXPORTER_GMAIL_USER_ID", default_value = "me")]
    pub user_id: String,

    #[arg(
        long,
        env = "EMAIL_EXPORTER_BACKWARDS_LOOKUP",
        default_value = "true",
        value_parser = BoolishValueParser::new(),
        action = clap::ArgAction::Set
    )]
    pub backwards_lookup: bool,

    /// MM/DD/YYYY; defaults to `lookback_days` ago
    #[arg(long, env = "MAIL_DATE_FROM")]
    pub date_from: Option<String>,

    /// MM/DD/YYYY; open-ended when unset
    #[arg(long, env = "MAIL_DATE_TO")]
    pub date_to: Option<String>,

    #[arg(long, env = "MAIL_FROM_DAYS", default_value_t = 30)]
    pub lookback_days: u32,

    #[arg(long, env = "EMAIL_EXPORTER_NEWER_THAN_HOURS", default_value_t = 1)]
    pub newer_than_hours: u32,

    #[arg(long, env = "MAPPINGS_FILE", default_value = "config/mappings.json")]
    pub mappings_file: PathBuf,

    #[arg(long, env = "SCHEMA_FILE", default_value = "config/schema.json")]
    pub schema_file: PathBuf,

    /// Defaults to token.json in the user config dir
    #[arg(long, env = "EMAIL_EXPORTER_OAUTH_TOKEN")]
    pub token_file: Option<PathBuf>,

    /// OAuth client secrets file; defaults to credentials.json in the user config dir
    #[arg(long, env = "EMAIL_EXPORTER_OAUTH_CREDENTIALS")]
    pub credentials_file: Option<PathBuf>,

    #[arg(
        long,
        env = "EMAIL_EXPORTER_REDIRECT_URI",
        default_value = "http://127.0.0.1:8080/callback"
    )]
    pub redirect_uri: String,

    /// Allow the browser flow; defaults to whether stdin is a terminal
    #[arg(
        long,
        env = "EMAIL_EXPORTER_INTERACTIVE_AUTH",
        value_parser = BoolishValueParser::new(),
        action = clap::ArgAction::Set
    )]
    pub interactive_auth: Option<bool>,

    #[arg(long, env = "EMAIL_EXPORTER_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Retries per template and cycle for transient provider errors
    #[arg(long, env = "EMAIL_EXPORTER_PROVIDER_RETRIES", default_value_t = 3)]
    pub provider_retries: u32,

    #[arg(long, env = "EMAIL_EXPORTER_RETRY_BACKOFF_SECONDS", default_value_t = 5)]
    pub retry_backoff: u64,

    #[arg(long, env = "EMAIL_EXPORTER_API_BASE", default_value = GMAIL_API_BASE)]
    pub api_base: String,
}

/// Validated configuration. Building one is the first thing the process does.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub log_level: Option<String>,
    pub poll: PollSettings,
    pub fetch: FetchSettings,
    pub lookback_days: u32,
    pub user_id: String,
    pub mappings_file: PathBuf,
    pub schema_file: PathBuf,
    pub token_file: PathBuf,
    pub credentials_file: PathBuf,
    pub redirect_uri: String,
    pub interactive_auth: bool,
    pub metrics_port: u16,
    pub api_base: String,
}

impl TryFrom<Settings> for ExporterConfig {
    type Error = ConfigError;

    fn try_from(s: Settings) -> Result<Self, ConfigError> {
        let fetch = FetchSettings::new(s.results_per_page, s.interval)?;

        at_least("EMAIL_EXPORTER_PERIOD_SECONDS", s.period, 1)?;
        at_least("EMAIL_EXPORTER_NEWER_THAN_HOURS", s.newer_than_hours.into(), 1)?;
        at_least("MAIL_FROM_DAYS", s.lookback_days.into(), 1)?;
        at_least("EMAIL_EXPORTER_RETRY_BACKOFF_SECONDS", s.retry_backoff, 1)?;
        if s.user_id.trim().is_empty() {
            return Err(ConfigError::Empty {
                name: "EMAIL_EXPORTER_GMAIL_USER_ID",
            });
        }

        // Dates are checked even when the backward lookup is off.
        let from = s
            .date_from
            .as_deref()
            .map(|v| parse_date("MAIL_DATE_FROM", v))
            .transpose()?;
        let to = s
            .date_to
            .as_deref()
            .map(|v| parse_date("MAIL_DATE_TO", v))
            .transpose()?;
        if let (Some(f), Some(t)) = (from, to)
            && f > t
        {
            return Err(ConfigError::InvertedRange {
                from: s.date_from.unwrap_or_default(),
                to: s.date_to.unwrap_or_default(),
            });
        }

        let poll = PollSettings {
            period: Duration::from_secs(s.period),
            recency_hours: s.newer_than_hours,
            backward_lookup: s.backwards_lookup.then(|| PollWindow::between(from, to)),
            provider_retries: s.provider_retries,
            retry_backoff: Duration::from_secs(s.retry_backoff),
        };

        Ok(Self {
            log_level: s.log_level,
            poll,
            fetch,
            lookback_days: s.lookback_days,
            user_id: s.user_id.trim().to_string(),
            mappings_file: s.mappings_file,
            schema_file: s.schema_file,
            token_file: s
                .token_file
                .unwrap_or_else(|| default_path("token.json")),
            credentials_file: s
                .credentials_file
                .unwrap_or_else(|| default_path("credentials.json")),
            redirect_uri: s.redirect_uri,
            interactive_auth: s
                .interactive_auth
                .unwrap_or_else(|| std::io::stdin().is_terminal()),
            metrics_port: s.port,
            api_base: s.api_base,
        })
    }
}

fn at_least(name: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { name, value, min });
    }
    Ok(())
}

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mail_exporter"))
}

/// `<user config dir>/mail_exporter/<file>`, or `<file>` when there is no config dir.
pub fn default_path(file: &str) -> PathBuf {
    config_dir()
        .map(|d| d.join(file))
        .unwrap_or_else(|| PathBuf::from(file))
}
