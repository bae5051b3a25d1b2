use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::{DecodeError, Engine as _};

use crate::domain::message::RawBody;

/// Decodes a provider body part into text; HTML parts are rendered to plain text.
pub fn decode_body(body: &RawBody) -> Result<String, DecodeError> {
    let bytes = decode_base64url(&body.data)?;
    if body.mime_type.eq_ignore_ascii_case("text/html") {
        return Ok(html_to_text(&bytes));
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The provider pads inconsistently, so try both alphabets' padding modes.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, DecodeError> {
    let data = data.trim();
    URL_SAFE
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')))
}

fn html_to_text(html: &[u8]) -> String {
    html2text::from_read(html, 120)
        .unwrap_or_else(|_| strip_html_minimal(&String::from_utf8_lossy(html)))
}

fn strip_html_minimal(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}
