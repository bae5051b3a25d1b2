use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Utc};
use log::{debug, info, warn};
use thiserror::Error;

use crate::auth::credential_store::{Credential, TokenSource};
use crate::clock::{Clock, Sleeper, SystemClock, ThreadSleeper};
use crate::domain::message::Message;
use crate::domain::template::EmailTemplate;
use crate::error::{AuthError, ProviderError, Result};
use crate::mail::decoders::decode_body;
use crate::mail::fetcher::{FetchSettings, PaginatedFetcher};
use crate::mail::gmail::MailProvider;
use crate::mail::query::{PollWindow, QueryBuilder};
use crate::metrics::ExporterMetrics;
use crate::parser::{MessageParser, ParseError};

/// Longest single sleep while waiting for the next cycle, so a stop request is noticed.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub period: Duration,
    pub recency_hours: u32,
    /// `Some` when the one-time catch-up pass is enabled.
    pub backward_lookup: Option<PollWindow>,
    pub provider_retries: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    BackwardLookup,
    SteadyState,
}

/// Steady-state cycles only dispatch messages at most `period` old, so a
/// recency window wider than the period does not re-dispatch every cycle.
pub fn is_recent_enough(
    mode: PollMode,
    message_time: DateTime<Utc>,
    now: DateTime<Utc>,
    period: Duration,
) -> bool {
    match mode {
        PollMode::BackwardLookup => true,
        PollMode::SteadyState => {
            let period = TimeDelta::from_std(period).unwrap_or(TimeDelta::MAX);
            now.signed_duration_since(message_time) <= period
        }
    }
}

/// Everything that lives across cycles. Built once at startup.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub credential: Credential,
    pub templates: Vec<EmailTemplate>,
    pub cycles: u64,
    pub dispatched: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl EngineState {
    pub fn new(credential: Credential, templates: Vec<EmailTemplate>) -> Self {
        Self {
            credential,
            templates,
            cycles: 0,
            dispatched: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: u64,
    pub dispatched: u64,
    pub skipped: u64,
    pub dispatch_failures: u64,
    pub failed_templates: u64,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message has no body")]
    NoBody,

    #[error("body is not valid base64url: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Decodes one message and hands it to the parser.
pub fn dispatch(
    parser: &mut dyn MessageParser,
    template: &EmailTemplate,
    message: &Message,
) -> Result<usize, DispatchError> {
    let raw = message.body.as_ref().ok_or(DispatchError::NoBody)?;
    let body = decode_body(raw)?;
    Ok(parser.parse(template, &body, message.internal_date)?)
}

pub struct PollingEngine<'a> {
    settings: &'a PollSettings,
    fetch: &'a FetchSettings,
    queries: QueryBuilder,
    provider: &'a dyn MailProvider,
    tokens: &'a dyn TokenSource,
    parser: &'a mut dyn MessageParser,
    metrics: ExporterMetrics,
    sleeper: &'a dyn Sleeper,
    clock: &'a dyn Clock,
}

impl<'a> PollingEngine<'a> {
    pub fn new(
        settings: &'a PollSettings,
        fetch: &'a FetchSettings,
        queries: QueryBuilder,
        provider: &'a dyn MailProvider,
        tokens: &'a dyn TokenSource,
        parser: &'a mut dyn MessageParser,
        metrics: ExporterMetrics,
    ) -> Self {
        Self {
            settings,
            fetch,
            queries,
            provider,
            tokens,
            parser,
            metrics,
            sleeper: &ThreadSleeper,
            clock: &SystemClock,
        }
    }

    pub fn with_sleeper(mut self, sleeper: &'a dyn Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Backward lookup (if enabled), then steady-state cycles until `running` is cleared.
    ///
    /// Returns only on a stop request or on an error no cycle can recover from.
    pub fn run(&mut self, mut state: EngineState, running: &AtomicBool) -> Result<EngineState> {
        if let Some(window) = self.settings.backward_lookup.clone() {
            info!("Backwards lookup is enabled");
            self.backward_lookup(&mut state, &window)?;
        } else {
            info!("Backwards lookup is disabled");
        }

        info!(
            "Watching {} template(s) every {} seconds",
            state.templates.len(),
            self.settings.period.as_secs()
        );
        while running.load(Ordering::SeqCst) {
            self.steady_cycle(&mut state)?;
            debug!("Sleeping {}s...", self.settings.period.as_secs());
            self.pause(self.settings.period, running);
        }

        info!(
            "Stopping after {} cycle(s), {} message(s) dispatched",
            state.cycles, state.dispatched
        );
        Ok(state)
    }

    pub fn backward_lookup(
        &mut self,
        state: &mut EngineState,
        window: &PollWindow,
    ) -> Result<CycleReport> {
        state.credential = self.tokens.revalidate(state.credential.clone())?;
        let report = self.process_templates(state, window, PollMode::BackwardLookup)?;
        info!(
            "Backwards lookup done: {} dispatched, {} failed",
            report.dispatched, report.dispatch_failures
        );
        Ok(report)
    }

    pub fn steady_cycle(&mut self, state: &mut EngineState) -> Result<CycleReport> {
        state.credential = self.tokens.revalidate(state.credential.clone())?;

        let hours = self.settings.recency_hours;
        debug!("Looking for messages in the last {hours} hour(s)");
        let report =
            self.process_templates(state, &PollWindow::newer_than(hours), PollMode::SteadyState)?;

        state.cycles += 1;
        self.metrics.cycles.inc();
        self.metrics
            .last_cycle
            .set(self.clock.now().timestamp_millis() as f64 / 1000.0);
        debug!("Cycle {} done: {report:?}", state.cycles);
        Ok(report)
    }

    fn process_templates(
        &mut self,
        state: &mut EngineState,
        window: &PollWindow,
        mode: PollMode,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let today = self.clock.now().with_timezone(&Local).date_naive();

        debug!("Iterating over {} templates", state.templates.len());
        for template in &state.templates {
            let query = self.queries.build(window, &template.sender, today);
            debug!("Template n°{}: query '{query}'", template.index + 1);

            let mut refreshed = false;
            loop {
                let token = state.credential.access_token.clone();
                match self.process_template_with_retry(&token, template, &query, mode, &mut report)
                {
                    Ok(()) => {}
                    // Tokens can be revoked or expire mid-pass; one forced refresh per template.
                    Err(e) if e.is_auth() && !refreshed => {
                        warn!("{e}; refreshing credentials and retrying {}", template.sender);
                        state.credential = self.tokens.force_refresh(state.credential.clone())?;
                        refreshed = true;
                        continue;
                    }
                    Err(ProviderError::Status { status, body, .. })
                        if status == 401 || status == 403 =>
                    {
                        return Err(AuthError::Rejected { status, body }.into());
                    }
                    Err(e) => {
                        warn!(
                            "Giving up on template n°{} ({}) for this pass: {e}",
                            template.index + 1,
                            template.sender
                        );
                        report.failed_templates += 1;
                    }
                }
                break;
            }
        }

        state.dispatched += report.dispatched;
        state.skipped += report.skipped;
        state.failed += report.dispatch_failures;
        Ok(report)
    }

    /// Transient errors restart this template's fetch after an exponential backoff,
    /// or after the provider's `Retry-After` when it sent one.
    fn process_template_with_retry(
        &mut self,
        token: &str,
        template: &EmailTemplate,
        query: &str,
        mode: PollMode,
        report: &mut CycleReport,
    ) -> Result<(), ProviderError> {
        let mut attempt = 0;
        loop {
            let err = match self.process_template(token, template, query, mode, report) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            self.metrics
                .provider_errors
                .with_label_values(&[template.sender.as_str(), err.kind()])
                .inc();

            if !err.is_transient() || attempt >= self.settings.provider_retries {
                return Err(err);
            }
            let backoff = err.retry_after().unwrap_or_else(|| {
                self.settings
                    .retry_backoff
                    .saturating_mul(2u32.saturating_pow(attempt))
            });
            attempt += 1;
            warn!(
                "{err}; retrying {} in {}s ({attempt}/{})",
                template.sender,
                backoff.as_secs(),
                self.settings.provider_retries
            );
            self.sleeper.sleep(backoff);
        }
    }

    fn process_template(
        &mut self,
        token: &str,
        template: &EmailTemplate,
        query: &str,
        mode: PollMode,
        report: &mut CycleReport,
    ) -> Result<(), ProviderError> {
        let sender = [template.sender.as_str()];
        let fetcher = PaginatedFetcher::new(self.provider, self.sleeper, self.fetch);

        for item in fetcher.fetch(token, query) {
            let message = item?;
            report.fetched += 1;
            self.metrics.fetched.with_label_values(&sender).inc();

            if !is_recent_enough(
                mode,
                message.internal_date,
                self.clock.now(),
                self.settings.period,
            ) {
                debug!(
                    "Skipping message {} because it was older than {} seconds",
                    message.id,
                    self.settings.period.as_secs()
                );
                report.skipped += 1;
                self.metrics.skipped.with_label_values(&sender).inc();
                continue;
            }

            match dispatch(&mut *self.parser, template, &message) {
                Ok(n) => {
                    debug!("Message {} gave {n} value(s)", message.id);
                    report.dispatched += 1;
                    self.metrics.dispatched.with_label_values(&sender).inc();
                }
                Err(e) => {
                    warn!("Message {} from {}: {e}", message.id, template.sender);
                    report.dispatch_failures += 1;
                    self.metrics.dispatch_failures.with_label_values(&sender).inc();
                }
            }
        }
        Ok(())
    }

    fn pause(&self, total: Duration, running: &AtomicBool) {
        let mut remaining = total;
        while !remaining.is_zero() && running.load(Ordering::SeqCst) {
            let step = remaining.min(SLEEP_SLICE);
            self.sleeper.sleep(step);
            remaining -= step;
        }
    }
}
