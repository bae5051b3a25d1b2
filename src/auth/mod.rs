pub mod credential_store;
pub mod oauth;
pub mod token_store;
