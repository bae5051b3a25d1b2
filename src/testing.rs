//! Hand-written fakes shared by the unit tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};

use crate::clock::{Clock, Sleeper};
use crate::domain::message::{Message, RawBody};
use crate::domain::template::EmailTemplate;
use crate::error::ProviderError;
use crate::mail::gmail::{MailProvider, ThreadPage};
use crate::parser::{MessageParser, ParseError};

struct PageEntry {
    sender: Option<String>,
    cursor: Option<String>,
    page: ThreadPage,
}

#[derive(Default)]
pub struct FakeProvider {
    pages: Vec<PageEntry>,
    messages: HashMap<String, Message>,
    failing_threads: HashMap<String, u16>,
    list_failures: RefCell<HashMap<String, (u16, u32, Option<Duration>)>>,
    list_calls: RefCell<Vec<(String, Option<String>)>>,
    get_calls: RefCell<Vec<String>>,
}

impl FakeProvider {
    pub fn with_page(self, cursor: Option<&str>, ids: &[&str], next: Option<&str>) -> Self {
        self.page_entry(None, cursor, ids, next)
    }

    /// A page only served to queries scoped to `sender`.
    pub fn with_page_for(
        self,
        sender: &str,
        cursor: Option<&str>,
        ids: &[&str],
        next: Option<&str>,
    ) -> Self {
        self.page_entry(Some(sender), cursor, ids, next)
    }

    fn page_entry(
        mut self,
        sender: Option<&str>,
        cursor: Option<&str>,
        ids: &[&str],
        next: Option<&str>,
    ) -> Self {
        self.pages.push(PageEntry {
            sender: sender.map(str::to_string),
            cursor: cursor.map(str::to_string),
            page: ThreadPage {
                thread_ids: ids.iter().map(|s| s.to_string()).collect(),
                next_page_token: next.map(str::to_string),
            },
        });
        self
    }

    pub fn with_message(mut self, thread_id: &str, at: DateTime<Utc>, body: &str) -> Self {
        self.messages.insert(
            thread_id.to_string(),
            Message {
                id: format!("m-{thread_id}"),
                thread_id: thread_id.to_string(),
                internal_date: at,
                body: Some(RawBody {
                    mime_type: "text/plain".into(),
                    data: URL_SAFE.encode(body),
                }),
            },
        );
        self
    }

    pub fn with_raw_message(mut self, message: Message) -> Self {
        self.messages.insert(message.thread_id.clone(), message);
        self
    }

    pub fn failing_thread(mut self, thread_id: &str, status: u16) -> Self {
        self.failing_threads.insert(thread_id.to_string(), status);
        self
    }

    /// The next `times` list calls for `sender` fail with `status`.
    pub fn failing_list(self, sender: &str, status: u16, times: u32) -> Self {
        self.list_failures
            .borrow_mut()
            .insert(sender.to_string(), (status, times, None));
        self
    }

    /// Like [`failing_list`](Self::failing_list) with 429 and a `Retry-After`.
    pub fn rate_limited(self, sender: &str, times: u32, retry_after: Duration) -> Self {
        self.list_failures
            .borrow_mut()
            .insert(sender.to_string(), (429, times, Some(retry_after)));
        self
    }

    pub fn list_calls(&self) -> Vec<Option<String>> {
        self.list_calls.borrow().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.list_calls.borrow().iter().map(|(q, _)| q.clone()).collect()
    }

    pub fn get_calls(&self) -> Vec<String> {
        self.get_calls.borrow().clone()
    }
}

impl MailProvider for FakeProvider {
    fn list_threads(
        &self,
        _access_token: &str,
        query: &str,
        _page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, ProviderError> {
        self.list_calls
            .borrow_mut()
            .push((query.to_string(), page_token.map(str::to_string)));

        for (sender, (status, remaining, retry_after)) in self.list_failures.borrow_mut().iter_mut() {
            if *remaining > 0 && query.contains(&format!("from:{sender}")) {
                *remaining -= 1;
                return Err(ProviderError::Status {
                    status: *status,
                    body: "fake failure".into(),
                    retry_after: *retry_after,
                });
            }
        }

        let page = self.pages.iter().find(|e| {
            e.cursor.as_deref() == page_token
                && e.sender
                    .as_ref()
                    .is_none_or(|s| query.contains(&format!("from:{s}")))
        });
        Ok(page.map(|e| e.page.clone()).unwrap_or_default())
    }

    fn get_thread_message(
        &self,
        _access_token: &str,
        thread_id: &str,
    ) -> Result<Message, ProviderError> {
        self.get_calls.borrow_mut().push(thread_id.to_string());
        if let Some(status) = self.failing_threads.get(thread_id) {
            return Err(ProviderError::Status {
                status: *status,
                body: "fake failure".into(),
                retry_after: None,
            });
        }
        self.messages
            .get(thread_id)
            .cloned()
            .ok_or_else(|| ProviderError::Decode(format!("unknown thread {thread_id}")))
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub template: usize,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Records every dispatch; bodies containing "BAD" fail to parse.
#[derive(Default)]
pub struct RecordingParser {
    pub dispatches: Vec<Dispatch>,
    pub failures: u32,
}

impl MessageParser for RecordingParser {
    fn parse(
        &mut self,
        template: &EmailTemplate,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, ParseError> {
        if body.contains("BAD") {
            self.failures += 1;
            return Err(ParseError::NotANumber {
                metric: "fake".into(),
                value: body.to_string(),
            });
        }
        self.dispatches.push(Dispatch {
            template: template.index,
            body: body.to_string(),
            timestamp,
        });
        Ok(1)
    }
}
