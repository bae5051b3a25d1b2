pub mod auth;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod mail;
pub mod metrics;
pub mod parser;

#[cfg(test)]
mod testing;
