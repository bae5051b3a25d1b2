use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use log::{debug, warn};
use oauth2::TokenResponse;
use oauth2::basic::BasicClient;
use oauth2::reqwest::http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, RefreshToken, Scope, TokenUrl,
};
use serde::Deserialize;
use tiny_http::{Response, Server};
use url::Url;

use crate::auth::credential_store::Authorizer;
use crate::auth::token_store;
use crate::error::{AuthError, ConfigError, ExporterError, Result};

pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens returned by the oauth flow (in-memory)
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// OAuth client registration, as downloaded from the provider console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<SecretsSection>,
    web: Option<SecretsSection>,
}

#[derive(Deserialize)]
struct SecretsSection {
    client_id: String,
    client_secret: Option<String>,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

impl ClientSecrets {
    /// Reads an "installed" or "web" client secrets file. A secret missing from the
    /// file is looked up in the keyring, then in `OAUTH_CLIENT_SECRET`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).map_err(|e| ExporterError::io(path, e))?;
        let file: SecretsFile = serde_json::from_str(&s).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let section = file
            .installed
            .or(file.web)
            .ok_or_else(|| ConfigError::ClientSecrets {
                path: path.to_path_buf(),
            })?;

        let client_secret = match section.client_secret.filter(|s| !s.is_empty()) {
            Some(s) => Some(s),
            None => keyring_secret(&section.client_id)
                .or_else(|| std::env::var("OAUTH_CLIENT_SECRET").ok()),
        };

        Ok(Self {
            client_id: section.client_id,
            client_secret,
            auth_uri: section.auth_uri.unwrap_or_else(|| GOOGLE_AUTH_URL.into()),
            token_uri: section.token_uri.unwrap_or_else(|| GOOGLE_TOKEN_URL.into()),
        })
    }

    fn client(&self) -> Result<BasicClient> {
        let auth_url = AuthUrl::new(self.auth_uri.clone())
            .map_err(|e| AuthError::Interactive(format!("bad auth_uri: {e}")))?;
        let token_url = TokenUrl::new(self.token_uri.clone())
            .map_err(|e| AuthError::Refresh(format!("bad token_uri: {e}")))?;
        Ok(BasicClient::new(
            ClientId::new(self.client_id.clone()),
            self.client_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        ))
    }
}

fn keyring_secret(client_id: &str) -> Option<String> {
    match token_store::load_client_secret(client_id) {
        Ok(v) => v,
        Err(e) => {
            warn!("Could not read client secret from keyring: {e}");
            None
        }
    }
}

/// Authorization Code + PKCE against Google, with a loopback redirect.
pub struct GoogleAuthorizer {
    secrets_file: PathBuf,
    redirect_uri: String,
    scope: String,
}

impl GoogleAuthorizer {
    pub fn new(secrets_file: impl Into<PathBuf>, redirect_uri: impl Into<String>) -> Self {
        Self {
            secrets_file: secrets_file.into(),
            redirect_uri: redirect_uri.into(),
            scope: GMAIL_READONLY_SCOPE.to_string(),
        }
    }
}

impl Authorizer for GoogleAuthorizer {
    /// Exchange a refresh token for a new access token using the oauth2 crate
    fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        let secrets = ClientSecrets::from_file(&self.secrets_file)?;
        let token = secrets
            .client()?
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request(http_client)
            .map_err(|e| AuthError::Refresh(e.to_string()))?;

        Ok(Tokens {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token.refresh_token().map(|r| r.secret().to_string()),
            expires_in: token.expires_in().map(|d| d.as_secs()),
        })
    }

    fn authorize(&self) -> Result<Tokens> {
        debug!(
            "Starting OAuth flow with credentials at '{}'",
            self.secrets_file.display()
        );
        let secrets = ClientSecrets::from_file(&self.secrets_file)?;
        perform_pkce_flow(&secrets, &self.redirect_uri, &self.scope)
            .map_err(|e| AuthError::Interactive(format!("{e:#}")).into())
    }
}

/// Consent URL asking for offline access, so Google also issues a refresh token.
fn authorize_url(client: &BasicClient, scope: &str) -> (Url, PkceCodeVerifier) {
    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
    let (auth_url, _csrf_token) = client
        .authorize_url(oauth2::CsrfToken::new_random)
        .add_scope(Scope::new(scope.to_string()))
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .set_pkce_challenge(pkce_challenge)
        .url();
    (auth_url, pkce_verifier)
}

/// Opens the system browser and captures the code via a tiny loopback server.
fn perform_pkce_flow(
    secrets: &ClientSecrets,
    redirect_uri: &str,
    scope: &str,
) -> anyhow::Result<Tokens> {
    // Parse redirect_uri so bind address matches exactly
    let redirect = Url::parse(redirect_uri)
        .map_err(|e| anyhow!("Invalid redirect_uri '{redirect_uri}': {e}"))?;

    let host = redirect
        .host_str()
        .ok_or_else(|| anyhow!("redirect_uri missing host: {redirect_uri}"))?;

    let port = redirect
        .port_or_known_default()
        .ok_or_else(|| anyhow!("redirect_uri missing/unknown port: {redirect_uri}"))?;

    let bind_ip: IpAddr = match host {
        "localhost" | "127.0.0.1" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse::<IpAddr>().map_err(|_| {
            anyhow!("redirect_uri host must be localhost/127.0.0.1 or an IP: {other}")
        })?,
    };

    let bind_addr = SocketAddr::new(bind_ip, port);

    // Listen before sending the user to the browser.
    let server = Server::http(bind_addr)
        .map_err(|e| anyhow!("Failed to bind OAuth callback server on {bind_addr}: {e:?}"))?;

    let oauth_client = secrets
        .client()
        .map_err(|e| anyhow!("{e}"))?
        .set_redirect_uri(RedirectUrl::new(redirect_uri.to_string())?);

    let (auth_url, pkce_verifier) = authorize_url(&oauth_client, scope);

    println!("Open this URL in your browser:\n{auth_url}");
    if let Err(e) = open::that(auth_url.as_str()) {
        warn!("Could not open browser automatically: {e}");
    }

    let mut code_opt: Option<String> = None;
    let wait_until = Instant::now() + Duration::from_secs(120);

    while Instant::now() < wait_until {
        let Ok(maybe_request) = server.recv_timeout(Duration::from_millis(500)) else {
            continue;
        };

        let Some(request) = maybe_request else {
            continue;
        };

        // request.url() is a path+query like "/callback?code=...&state=..."
        let full = format!("http://{}:{}{}", host, port, request.url());

        match Url::parse(&full) {
            Ok(parsed) => {
                code_opt = parsed
                    .query_pairs()
                    .find(|(k, _)| k == "code")
                    .map(|(_, v)| v.into_owned());

                if code_opt.is_some() {
                    let _ = request.respond(Response::from_string(
                        "Authorization received. You can close this tab.",
                    ));
                    break;
                }
                let _ = request.respond(Response::from_string(
                    "No code found in redirect. You can close this tab.",
                ));
            }
            Err(_) => {
                let _ = request.respond(Response::from_string("Bad redirect"));
            }
        }
    }

    let code = code_opt.ok_or_else(|| anyhow!("No code received within timeout"))?;

    let token = oauth_client
        .exchange_code(AuthorizationCode::new(code))
        .set_pkce_verifier(pkce_verifier)
        .request(http_client)
        .map_err(|e| anyhow!("Token exchange failed: {e:?}"))?;

    Ok(Tokens {
        access_token: token.access_token().secret().to_string(),
        refresh_token: token.refresh_token().map(|r| r.secret().to_string()),
        expires_in: token.expires_in().map(|d| d.as_secs()),
    })
}
