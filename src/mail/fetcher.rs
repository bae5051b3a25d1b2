use std::collections::VecDeque;
use std::time::Duration;

use log::debug;

use crate::clock::Sleeper;
use crate::domain::message::Message;
use crate::error::{ConfigError, ProviderError};
use crate::mail::gmail::MailProvider;

/// Provider quota ceiling for results per page.
pub const MAX_PAGE_SIZE: u32 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub page_size: u32,
    pub interval: Duration,
}

impl FetchSettings {
    pub fn new(page_size: u32, interval_secs: u64) -> Result<Self, ConfigError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::PageSize {
                value: page_size,
                max: MAX_PAGE_SIZE,
            });
        }
        if interval_secs < 1 {
            return Err(ConfigError::Interval(interval_secs));
        }
        Ok(Self {
            page_size,
            interval: Duration::from_secs(interval_secs),
        })
    }
}

/// Drives list/get in pages, pausing between pages to stay under the rate budget.
#[derive(Clone, Copy)]
pub struct PaginatedFetcher<'a> {
    provider: &'a dyn MailProvider,
    sleeper: &'a dyn Sleeper,
    settings: &'a FetchSettings,
}

impl<'a> PaginatedFetcher<'a> {
    pub fn new(
        provider: &'a dyn MailProvider,
        sleeper: &'a dyn Sleeper,
        settings: &'a FetchSettings,
    ) -> Self {
        Self {
            provider,
            sleeper,
            settings,
        }
    }

    /// Lazily yields every message matching `query`, in page order.
    ///
    /// The first error ends the sequence.
    pub fn fetch(self, access_token: &'a str, query: &'a str) -> Messages<'a> {
        debug!("Getting emails, query: '{query}'");
        Messages {
            fetcher: self,
            access_token,
            query,
            state: State::Requesting(None),
            pages: 0,
        }
    }
}

enum State {
    Requesting(Option<String>),
    Yielding {
        ids: VecDeque<String>,
        cursor: Option<String>,
    },
    Delaying(String),
    Done,
}

pub struct Messages<'a> {
    fetcher: PaginatedFetcher<'a>,
    access_token: &'a str,
    query: &'a str,
    state: State,
    pages: u32,
}

impl Messages<'_> {
    /// Pages requested so far.
    pub fn pages(&self) -> u32 {
        self.pages
    }
}

impl Iterator for Messages<'_> {
    type Item = Result<Message, ProviderError>;

    fn next(&mut self) -> Option<Self::Item> {
        let provider = self.fetcher.provider;
        loop {
            match std::mem::replace(&mut self.state, State::Done) {
                State::Requesting(cursor) => {
                    self.pages += 1;
                    debug!("Results page no. {}", self.pages);
                    let page = match provider.list_threads(
                        self.access_token,
                        self.query,
                        self.fetcher.settings.page_size,
                        cursor.as_deref(),
                    ) {
                        Ok(p) => p,
                        Err(e) => return Some(Err(e)),
                    };
                    if page.thread_ids.is_empty() {
                        debug!("Got no threads");
                        return None;
                    }
                    self.state = State::Yielding {
                        ids: page.thread_ids.into(),
                        cursor: page.next_page_token,
                    };
                }
                State::Yielding { mut ids, cursor } => match ids.pop_front() {
                    Some(id) => {
                        let item = provider.get_thread_message(self.access_token, &id);
                        if item.is_ok() {
                            self.state = State::Yielding { ids, cursor };
                        }
                        return Some(item);
                    }
                    None => {
                        self.state = match cursor {
                            Some(c) => State::Delaying(c),
                            None => {
                                debug!("Got to the end of the mail list");
                                State::Done
                            }
                        }
                    }
                },
                State::Delaying(cursor) => {
                    let interval = self.fetcher.settings.interval;
                    debug!("Got nextPageToken, sleeping for {}s", interval.as_secs());
                    self.fetcher.sleeper.sleep(interval);
                    self.state = State::Requesting(Some(cursor));
                }
                State::Done => return None,
            }
        }
    }
}
