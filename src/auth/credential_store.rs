use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::auth::oauth::Tokens;
use crate::error::{AuthError, ConfigError, ExporterError, Result};

/// Tokens this close to expiry are treated as already expired.
pub const EXPIRY_SKEW_SECS: i64 = 60;

/// Used when the token endpoint does not say how long the token lives.
const DEFAULT_LIFETIME_SECS: i64 = 3500;

/// Persisted as-is in the token file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at_epoch: Option<i64>, // epoch seconds
}

impl Credential {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at_epoch
            .is_some_and(|exp| now >= exp - EXPIRY_SKEW_SECS)
    }

    /// Builds a credential from a token response, keeping `previous_refresh`
    /// when the provider did not rotate the refresh token.
    pub fn from_tokens(tokens: Tokens, now: i64, previous_refresh: Option<String>) -> Self {
        let lifetime = tokens
            .expires_in
            .map(|s| s as i64)
            .unwrap_or(DEFAULT_LIFETIME_SECS);
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(previous_refresh),
            expires_at_epoch: Some(now + lifetime),
        }
    }
}

/// Talks to the provider's authorization server.
pub trait Authorizer {
    fn refresh(&self, refresh_token: &str) -> Result<Tokens>;

    /// Interactive flow: needs a human at a browser.
    fn authorize(&self) -> Result<Tokens>;
}

/// What the poller needs from credential handling once it is running.
pub trait TokenSource {
    /// Returns `current` untouched while valid, otherwise a refreshed (and persisted) one.
    fn revalidate(&self, current: Credential) -> Result<Credential>;

    /// Renews `current` regardless of its recorded expiry, after the provider rejected it.
    fn force_refresh(&self, current: Credential) -> Result<Credential>;
}

pub struct CredentialStore<A> {
    path: PathBuf,
    authorizer: A,
    interactive: bool,
}

impl<A: Authorizer> CredentialStore<A> {
    pub fn new(path: impl Into<PathBuf>, authorizer: A, interactive: bool) -> Self {
        Self {
            path: path.into(),
            authorizer,
            interactive,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the token file if present.
    pub fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            debug!("No token file at '{}'", self.path.display());
            return Ok(None);
        }
        let s = fs::read_to_string(&self.path).map_err(|e| ExporterError::io(&self.path, e))?;
        let c = serde_json::from_str(&s).map_err(|source| ConfigError::Json {
            path: self.path.clone(),
            source,
        })?;
        debug!("Found token file: '{}'", self.path.display());
        Ok(Some(c))
    }

    pub fn persist(&self, credential: &Credential) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| ExporterError::io(dir, e))?;
        }
        let s = serde_json::to_string_pretty(credential).map_err(|source| ConfigError::Json {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, s).map_err(|e| ExporterError::io(&self.path, e))?;
        debug!("Wrote token file to '{}'", self.path.display());
        Ok(())
    }

    /// 1) unexpired -> as-is, 2) refresh token -> refresh, 3) otherwise interactive.
    ///
    /// Refresh failures are returned, not retried and not downgraded to the interactive flow.
    pub fn ensure_valid(&self, current: Option<Credential>) -> Result<Credential> {
        let now = Utc::now().timestamp();

        let previous_refresh = match current {
            Some(c) if !c.is_expired_at(now) => {
                debug!("Credentials are valid");
                return Ok(c);
            }
            Some(c) => c.refresh_token,
            None => None,
        };
        debug!("Credentials expired or missing");
        self.renew(previous_refresh, now)
    }

    /// Same as [`ensure_valid`](Self::ensure_valid) for an expired `current`.
    pub fn force_refresh(&self, current: Credential) -> Result<Credential> {
        debug!("Credentials rejected by the provider");
        self.renew(current.refresh_token, Utc::now().timestamp())
    }

    fn renew(&self, previous_refresh: Option<String>, now: i64) -> Result<Credential> {
        let fresh = if let Some(rt) = previous_refresh {
            debug!("Refreshing credentials");
            let t = self.authorizer.refresh(&rt)?;
            info!("Refreshed credentials");
            Credential::from_tokens(t, now, Some(rt))
        } else {
            if !self.interactive {
                return Err(AuthError::InteractiveUnavailable.into());
            }
            info!("No usable credentials, starting interactive authorization");
            let t = self.authorizer.authorize()?;
            info!("Authorization completed");
            Credential::from_tokens(t, now, None)
        };

        self.persist(&fresh)?;
        Ok(fresh)
    }
}

impl<A: Authorizer> TokenSource for CredentialStore<A> {
    fn revalidate(&self, current: Credential) -> Result<Credential> {
        self.ensure_valid(Some(current))
    }

    fn force_refresh(&self, current: Credential) -> Result<Credential> {
        CredentialStore::force_refresh(self, current)
    }
}
