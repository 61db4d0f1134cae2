//! Plugin registration and dispatch.
//!
//! A plugin contributes handlers for request and response types. Each
//! `(direction, type)` pair has exactly one handler; registering a second one
//! fails at load time, before the server accepts any connection.
//!
//! Handlers are plain synchronous functions. They reach the rest of the
//! server through a context object and never see the socket or the codec:
//!
//! ```rust
//! use karfunkel::plugin::{HandlerError, Plugin, PluginRegistry, RegistryError, RequestContext, RequestHandler};
//! use protocol::{Parameters, Status};
//!
//! struct Echo;
//!
//! fn echo(ctx: &mut RequestContext<'_>) -> Result<(), HandlerError> {
//!     let text = ctx.require("text")?.to_string();
//!     ctx.answer(Status::Ok, Parameters::from([("text".to_string(), text)]));
//!     Ok(())
//! }
//!
//! impl Plugin for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn register(&self, registry: &mut PluginRegistry) -> Result<(), RegistryError> {
//!         registry.register_request(RequestHandler::new("Echo").required("text").handle(echo))
//!     }
//! }
//! ```

use std::fmt;

use protocol::Status;
use thiserror::Error;

mod context;
mod deferred;
mod handler;
mod registry;

pub(crate) use context::reason_param;
pub use context::{RequestContext, ResponseContext};
pub use deferred::{DeferredContext, DeferredTask, TaskState};
pub use handler::{RequestHandler, RequestHandlerBuilder, ResponseHandler, ResponseHandlerBuilder};
pub use registry::PluginRegistry;

/// A unit of functionality loaded into the server at startup.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Adds this plugin's handlers to the registry.
    fn register(&self, registry: &mut PluginRegistry) -> Result<(), RegistryError>;
}

/// Which kind of message a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("plugin `{plugin}` registers a {direction} handler for `{kind}`, already provided by `{owner}`")]
    Duplicate {
        direction: Direction,
        kind: String,
        owner: String,
        plugin: String,
    },
    #[error("`{0}` is handled by the connection itself and cannot be registered")]
    Reserved(String),
    #[error("unknown {direction} type `{kind}`")]
    UnknownType { direction: Direction, kind: String },
    #[error("unknown plugin `{0}`")]
    UnknownPlugin(String),
}

/// Failure reported by a handler. Turned into a response by the dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A parameter is present but unusable.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    /// The request is valid but cannot be honoured in the current state.
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Status of the response the dispatcher sends for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidParameter { .. } | Self::Rejected(_) => Status::Rejected,
            Self::Failed(_) | Self::Io(_) => Status::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_statuses() {
        let invalid = HandlerError::invalid_parameter("file", "/nope does not exist");
        assert_eq!(invalid.status(), Status::Rejected);
        assert_eq!(invalid.to_string(), "invalid parameter file: /nope does not exist");

        assert_eq!(HandlerError::Rejected("busy".into()).status(), Status::Rejected);
        assert_eq!(HandlerError::Failed("boom".into()).status(), Status::Error);

        let io = HandlerError::from(std::io::Error::other("disk"));
        assert_eq!(io.status(), Status::Error);
    }

    #[test]
    fn test_registry_error_messages() {
        let duplicate = RegistryError::Duplicate {
            direction: Direction::Request,
            kind: "Ping".into(),
            owner: "core".into(),
            plugin: "extra".into(),
        };
        assert_eq!(
            duplicate.to_string(),
            "plugin `extra` registers a request handler for `Ping`, already provided by `core`"
        );
    }
}
