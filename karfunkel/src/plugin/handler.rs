use std::fmt;
use std::sync::Arc;

use protocol::RequestSchema;

use super::context::{RequestContext, ResponseContext};
use super::HandlerError;

pub(crate) type RequestFn =
    dyn Fn(&mut RequestContext<'_>) -> Result<(), HandlerError> + Send + Sync;
pub(crate) type ResponseFn =
    dyn Fn(&mut ResponseContext<'_>) -> Result<(), HandlerError> + Send + Sync;

/// Descriptor for one request type: its parameter schema and its handler.
#[derive(Clone)]
pub struct RequestHandler {
    schema: RequestSchema,
    handler: Arc<RequestFn>,
}

impl RequestHandler {
    /// Starts describing a handler for requests of type `kind`.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(kind: impl Into<String>) -> RequestHandlerBuilder {
        RequestHandlerBuilder {
            schema: RequestSchema::new(kind),
        }
    }

    pub fn kind(&self) -> &str {
        self.schema.kind()
    }

    pub fn schema(&self) -> &RequestSchema {
        &self.schema
    }

    pub(crate) fn call(&self, ctx: &mut RequestContext<'_>) -> Result<(), HandlerError> {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

pub struct RequestHandlerBuilder {
    schema: RequestSchema,
}

impl RequestHandlerBuilder {
    /// Declares a parameter every request of this type must carry.
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.schema = self.schema.required(name);
        self
    }

    /// Declares a parameter filled in with `default` when omitted.
    pub fn optional(mut self, name: impl Into<String>, default: impl Into<String>) -> Self {
        self.schema = self.schema.optional(name, default);
        self
    }

    pub fn handle<F>(self, handler: F) -> RequestHandler
    where
        F: Fn(&mut RequestContext<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        RequestHandler {
            schema: self.schema,
            handler: Arc::new(handler),
        }
    }
}

/// Descriptor for responses answering requests of one type.
#[derive(Clone)]
pub struct ResponseHandler {
    kind: String,
    handler: Arc<ResponseFn>,
}

impl ResponseHandler {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(kind: impl Into<String>) -> ResponseHandlerBuilder {
        ResponseHandlerBuilder { kind: kind.into() }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub(crate) fn call(&self, ctx: &mut ResponseContext<'_>) -> Result<(), HandlerError> {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandler")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

pub struct ResponseHandlerBuilder {
    kind: String,
}

impl ResponseHandlerBuilder {
    pub fn handle<F>(self, handler: F) -> ResponseHandler
    where
        F: Fn(&mut ResponseContext<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        ResponseHandler {
            kind: self.kind,
            handler: Arc::new(handler),
        }
    }
}
