//! In-memory command model.
//!
//! Requests expect exactly one final [`Response`]; notifications are
//! fire-and-forget broadcasts. A [`Command`] bundles all three as sent by one
//! peer in one frame.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::kinds;

/// Identifier the server assigns to a client during the handshake.
pub type ClientId = u32;

/// Identifier of a request or response, unique per sender.
pub type RequestId = u64;

/// Parameter name/value pairs carried by every message.
pub type Parameters = BTreeMap<String, String>;

/// Outcome carried by a [`Response`].
///
/// The vocabulary is open: plugins may answer with statuses the core does not
/// know, which survive a round trip as [`Status::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Rejected,
    Error,
    /// Interim answer for long-running requests. More responses follow.
    Processing,
    Failed,
    Finished,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ok => "ok",
            Self::Rejected => "rejected",
            Self::Error => "error",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Other(other) => other,
        }
    }

    /// Whether this response ends the correlation with its request.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

impl From<&str> for Status {
    fn from(value: &str) -> Self {
        match value {
            "ok" => Self::Ok,
            "rejected" => Self::Rejected,
            "error" => Self::Error,
            "processing" => Self::Processing,
            "failed" => Self::Failed,
            "finished" => Self::Finished,
            other => Self::Other(other.to_string()),
        }
    }
}

impl FromStr for Status {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(value))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that expects a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    /// The request type, e.g. `OpenProject`.
    pub kind: String,
    pub parameters: Parameters,
    /// Responses correlated to this request so far, interim ones included.
    /// Never sent on the wire.
    pub responses: Vec<Response>,
}

impl Request {
    pub fn new(id: RequestId, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            parameters: Parameters::new(),
            responses: Vec::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn is_hello(&self) -> bool {
        self.kind == kinds::HELLO
    }

    /// Whether a final response has been recorded.
    pub fn is_answered(&self) -> bool {
        self.responses.iter().any(|response| response.status.is_final())
    }
}

/// Answer to a previously sent [`Request`].
///
/// `kind` and `answers` always name the originating request; `id` is the
/// response's own wire id and is independent of the request's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: RequestId,
    pub kind: String,
    pub answers: RequestId,
    pub status: Status,
    pub parameters: Parameters,
}

impl Response {
    /// Builds a response correlated to `request`.
    pub fn to(request: &Request, id: RequestId, status: Status) -> Self {
        Self {
            id,
            kind: request.kind.clone(),
            answers: request.id,
            status,
            parameters: Parameters::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_params(mut self, parameters: Parameters) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Unsolicited broadcast. Never answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: String,
    pub parameters: Parameters,
}

impl Notification {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: Parameters::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_params(mut self, parameters: Parameters) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// The unit exchanged over the wire: everything one peer sends in one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    /// Id of the sending client. The server sends without one, and so does a
    /// client that has not completed the handshake yet.
    pub sender: Option<ClientId>,
    pub requests: Vec<Request>,
    pub responses: Vec<Response>,
    pub notifications: Vec<Notification>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sender(sender: ClientId) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.requests.push(request);
        self
    }

    pub fn with_response(mut self, response: Response) -> Self {
        self.responses.push(response);
        self
    }

    pub fn with_notification(mut self, notification: Notification) -> Self {
        self.notifications.push(notification);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.responses.is_empty() && self.notifications.is_empty()
    }

    /// Whether this command is a well-formed handshake: a single `Hello`
    /// request and nothing else.
    pub fn is_handshake(&self) -> bool {
        self.sender.is_none()
            && self.responses.is_empty()
            && self.notifications.is_empty()
            && matches!(self.requests.as_slice(), [request] if request.is_hello())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        let known = ["ok", "rejected", "error", "processing", "failed", "finished"];
        for name in known {
            let status: Status = name.parse().unwrap();
            assert_eq!(status.as_str(), name);
            assert!(!matches!(status, Status::Other(_)));
        }

        let custom: Status = "queued".parse().unwrap();
        assert_eq!(custom, Status::Other("queued".to_string()));
        assert_eq!(custom.to_string(), "queued");
    }

    #[test]
    fn test_only_processing_is_interim() {
        assert!(!Status::Processing.is_final());
        assert!(Status::Ok.is_final());
        assert!(Status::Finished.is_final());
        assert!(Status::Other("queued".to_string()).is_final());
    }

    #[test]
    fn test_response_correlates_to_request() {
        let request = Request::new(7, "OpenProject").with_param("file", "/tmp/p");
        let response = Response::to(&request, 42, Status::Rejected);

        assert_eq!(response.id, 42);
        assert_eq!(response.answers, 7);
        assert_eq!(response.kind, "OpenProject");
        assert!(response.parameters.is_empty());
    }

    #[test]
    fn test_handshake_detection() {
        let hello = Request::new(1, kinds::HELLO).with_param("os", "linux");
        assert!(Command::new().with_request(hello.clone()).is_handshake());

        let bundled = Command::new()
            .with_request(hello.clone())
            .with_request(Request::new(2, "Ping"));
        assert!(!bundled.is_handshake());

        let mut with_sender = Command::from_sender(3);
        with_sender.requests.push(hello);
        assert!(!with_sender.is_handshake());

        assert!(!Command::new().with_request(Request::new(1, "Ping")).is_handshake());
        assert!(!Command::new().is_handshake());
    }

    #[test]
    fn test_empty_command() {
        assert!(Command::new().is_empty());
        assert!(!Command::new()
            .with_notification(Notification::new("ProjectClosed"))
            .is_empty());
    }
}
