use anyhow::{Context, Result};
use keyring::{Entry, Error as KeyringError};

/// Keyring service; the account is the OAuth client id.
const SERVICE: &str = "mail_exporter";

fn entry(client_id: &str) -> Result<Entry> {
    Entry::new(SERVICE, client_id)
        .with_context(|| format!("Could not open keyring entry for client_id {client_id}"))
}

pub fn save_client_secret(client_id: &str, client_secret: &str) -> Result<()> {
    anyhow::ensure!(!client_secret.is_empty(), "Client secret is empty");
    entry(client_id)?
        .set_password(client_secret)
        .with_context(|| format!("Could not store client secret for {client_id}"))
}

/// `None` when nothing was stored for this client id.
pub fn load_client_secret(client_id: &str) -> Result<Option<String>> {
    match entry(client_id)?.get_password() {
        Ok(v) => Ok(Some(v)),
        Err(KeyringError::NoEntry) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Could not read client secret for {client_id}")),
    }
}
