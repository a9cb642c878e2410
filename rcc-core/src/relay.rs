//! Alternate request/response path through a relay server.
//!
//! When the deployment relays traffic over HTTP instead of a direct
//! socket, each command is a one-shot exchange keyed by a URI and a POST
//! body. The engine only needs the [`AlternateTransport`] seam; the HTTP
//! client itself lives with the caller.
//!
//! Relay replies report failures in-band through `StatusCode` (or
//! `ErrorCode`) and `StatusDescription` child elements of the root;
//! [`parse_server_error`] extracts them.

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::RccError;

/// One-shot request/response exchange used instead of the socket.
#[async_trait]
pub trait AlternateTransport: Send + Sync {
    /// POST `post_body` to `uri` and return the reply document.
    async fn make_request(&self, uri: &str, post_body: &str) -> Result<String, RccError>;
}

/// How commands leave the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Framed TCP through the dispatch queue.
    #[default]
    Stream,
    /// One-shot exchanges through the installed [`AlternateTransport`].
    Relay { uri: String },
}

// ── Server status ────────────────────────────────────────────────

pub const STATUS_TIMEOUT: i32 = 1;
pub const STATUS_UNKNOWN_INSTRUMENT: i32 = 5;
pub const STATUS_EXCEPTION: i32 = 6;
pub const STATUS_UNABLE_TO_EXECUTE: i32 = 7;
pub const STATUS_FAILED_USER_VALIDATION: i32 = -1;
pub const STATUS_UNKNOWN_ERROR: i32 = -2;

/// Error information carried by a relay reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub status_code: i32,
    pub description: String,
}

impl ServerError {
    /// Text suitable for showing to an operator.
    pub fn message(&self) -> String {
        match self.status_code {
            STATUS_EXCEPTION => self.description.clone(),
            STATUS_TIMEOUT => {
                "A timeout occurred waiting for instrument response. Please check internet connection."
                    .into()
            }
            STATUS_UNKNOWN_INSTRUMENT => "The instrument is not currently online.".into(),
            STATUS_FAILED_USER_VALIDATION => {
                "The instrument has indicated that the supplied credentials are invalid. Ensure password is correct."
                    .into()
            }
            STATUS_UNABLE_TO_EXECUTE => {
                "Unable to execute remote command. Please check the instrument remote query expiration."
                    .into()
            }
            STATUS_UNKNOWN_ERROR => format!(
                "An unknown error has occurred attempting communicate with server. Status code: {}. {}",
                self.status_code, self.description
            ),
            code => format!(
                "An unknown error has occurred attempting communicate with server. Status code: {code}."
            ),
        }
    }
}

#[derive(Debug, Default)]
struct StatusFields {
    root: String,
    text: String,
    status_code: Option<String>,
    error_code: Option<String>,
    description: Option<String>,
}

impl StatusFields {
    fn code(&self) -> i32 {
        self.status_code
            .as_deref()
            .or(self.error_code.as_deref())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

fn read_status(document: &str) -> Option<StatusFields> {
    let mut reader = Reader::from_str(document);
    let mut fields = StatusFields::default();
    let mut depth = 0usize;
    let mut child: Option<String> = None;

    loop {
        match reader.read_event().ok()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match depth {
                    0 => fields.root = name,
                    1 => child = Some(name),
                    _ => {}
                }
                depth += 1;
            }
            Event::Empty(e) if depth == 0 => {
                fields.root = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    child = None;
                }
            }
            Event::Text(t) if depth > 0 => {
                let value = t.unescape().ok()?.into_owned();
                fields.text.push_str(&value);
                if depth == 2 {
                    let slot = match child.as_deref() {
                        Some("StatusCode") => &mut fields.status_code,
                        Some("ErrorCode") => &mut fields.error_code,
                        Some("StatusDescription") => &mut fields.description,
                        _ => continue,
                    };
                    slot.get_or_insert_with(String::new).push_str(&value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    (!fields.root.is_empty()).then_some(fields)
}

/// Inspect a relay reply for error information.
///
/// Returns `None` when the reply carries no error.
pub fn parse_server_error(document: &str, expected_root: &str) -> Option<ServerError> {
    let fields = read_status(document)?;
    let code = fields.code();
    let description = fields.description.clone().unwrap_or_default();

    if code != 0 {
        return Some(ServerError {
            status_code: code,
            description,
        });
    }
    if fields.root == expected_root {
        return None;
    }

    // Unexpected root without a status code.
    if fields.root.eq_ignore_ascii_case("UserValidation") {
        let passed = fields.text.trim().eq_ignore_ascii_case("true");
        return (!passed).then(|| ServerError {
            status_code: STATUS_FAILED_USER_VALIDATION,
            description: String::new(),
        });
    }
    Some(ServerError {
        status_code: STATUS_UNKNOWN_ERROR,
        description: fields.text,
    })
}
