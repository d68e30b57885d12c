//! Unified error type and the wire-visible error payload.

use serde::Serialize;

/// Boxed error used for opaque failures (body streams, validators).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by sluice's fallible operations.
///
/// Application-level errors (404, 412, validation failures) are expressed as
/// HTTP [`Response`](crate::Response) values, not as `Error`s. This type
/// surfaces infrastructure failures: binding a port, reading the request body,
/// serialising or writing a response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reading request body: {0}")]
    Body(#[source] BoxError),

    #[error("invalid header `{name}`")]
    InvalidHeader { name: String },

    #[error("invalid socket address `{0}`")]
    Addr(String),
}

/// Error payload written for every client- and server-side failure response.
///
/// Serialises as `{"code": "...", "message": "..."}`; empty fields are left out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted() {
        let json = serde_json::to_string(&ErrorBody::new("BadRequest", "")).unwrap();
        assert_eq!(json, r#"{"code":"BadRequest"}"#);

        let json = serde_json::to_string(&ErrorBody::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn display_names_the_failing_layer() {
        let err = Error::InvalidHeader { name: "bad header".into() };
        assert_eq!(err.to_string(), "invalid header `bad header`");
    }
}
