use chrono::{DateTime, Utc};

pub type MessageId = String;

/// One message as retrieved from the provider. Dropped once dispatched.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: String,
    pub internal_date: DateTime<Utc>,
    pub body: Option<RawBody>,
}

/// Body exactly as the provider sent it: base64url data plus the part's MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBody {
    pub mime_type: String,
    pub data: String,
}
