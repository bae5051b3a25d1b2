use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::domain::message::{Message, RawBody};
use crate::error::ProviderError;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadPage {
    pub thread_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// The two provider operations the poller consumes.
pub trait MailProvider {
    fn list_threads(
        &self,
        access_token: &str,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, ProviderError>;

    /// Fetches a thread and returns its first message.
    fn get_thread_message(
        &self,
        access_token: &str,
        thread_id: &str,
    ) -> Result<Message, ProviderError>;
}

pub struct GmailClient {
    http: Client,
    base_url: String,
    user_id: String,
}

impl GmailClient {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
        }
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}/users/{}/{}", self.base_url, self.user_id, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(query)
            .send()?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text()?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }
        serde_json::from_str(&body).map_err(|e| ProviderError::Decode(format!("{path}: {e}")))
    }
}

impl MailProvider for GmailClient {
    fn list_threads(
        &self,
        access_token: &str,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, ProviderError> {
        let max_results = page_size.to_string();
        let mut params = vec![("q", query), ("maxResults", max_results.as_str())];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let list: ThreadList = self.get_json(access_token, "threads", &params)?;
        Ok(ThreadPage {
            thread_ids: list.threads.into_iter().map(|t| t.id).collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    fn get_thread_message(
        &self,
        access_token: &str,
        thread_id: &str,
    ) -> Result<Message, ProviderError> {
        debug!("Getting mail thread '{thread_id}'");
        let thread: Thread =
            self.get_json(access_token, &format!("threads/{thread_id}"), &[("format", "full")])?;

        // Only the first message of a thread is considered.
        let first = thread
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode(format!("thread {thread_id} has no messages")))?;

        let millis: i64 = first.internal_date.parse().map_err(|_| {
            ProviderError::Decode(format!(
                "message {}: bad internalDate '{}'",
                first.id, first.internal_date
            ))
        })?;

        Ok(Message {
            internal_date: from_millis(millis).ok_or_else(|| {
                ProviderError::Decode(format!("message {}: internalDate out of range", first.id))
            })?,
            body: first.payload.as_ref().and_then(select_body),
            id: first.id,
            thread_id: first.thread_id.unwrap_or(thread.id),
        })
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Top-level body data first, then the first text/plain part, then text/html.
fn select_body(payload: &Part) -> Option<RawBody> {
    if let Some(data) = payload.data() {
        return Some(RawBody {
            mime_type: payload.mime_type.clone().unwrap_or_else(|| "text/plain".into()),
            data: data.to_string(),
        });
    }
    find_part(payload, "text/plain").or_else(|| find_part(payload, "text/html"))
}

fn find_part(p: &Part, mime: &str) -> Option<RawBody> {
    let is_match = p
        .mime_type
        .as_deref()
        .is_some_and(|m| m.eq_ignore_ascii_case(mime));
    if is_match && let Some(data) = p.data() {
        return Some(RawBody {
            mime_type: mime.to_string(),
            data: data.to_string(),
        });
    }
    p.parts.iter().find_map(|sp| find_part(sp, mime))
}

#[derive(Debug, Deserialize)]
struct ThreadList {
    #[serde(default)]
    threads: Vec<ThreadStub>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Thread {
    id: String,
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    #[serde(rename = "internalDate")]
    internal_date: String,
    payload: Option<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Part {
    fn data(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .filter(|d| !d.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct PartBody {
    data: Option<String>,
}
