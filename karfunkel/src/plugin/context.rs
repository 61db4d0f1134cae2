use std::sync::Arc;
use std::time::Duration;

use protocol::{Notification, Parameters, Request, Response, Status};

use super::deferred::{self, DeferredContext, DeferredTask};
use super::HandlerError;
use crate::client::Client;
use crate::server::Karfunkel;

/// Everything a request handler may touch while serving one request.
///
/// Answers are collected and written back by the connection once the whole
/// frame has been dispatched.
pub struct RequestContext<'a> {
    server: &'a Arc<Karfunkel>,
    client: &'a Client,
    request: &'a Request,
    replies: Vec<Response>,
}

impl<'a> RequestContext<'a> {
    pub fn new(server: &'a Arc<Karfunkel>, client: &'a Client, request: &'a Request) -> Self {
        Self {
            server,
            client,
            request,
            replies: Vec::new(),
        }
    }

    pub fn server(&self) -> &'a Arc<Karfunkel> {
        self.server
    }

    pub fn client(&self) -> &'a Client {
        self.client
    }

    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn param(&self, name: &str) -> Option<&'a str> {
        self.request.param(name)
    }

    /// Like [`param`](Self::param), failing with `InvalidParameter` when absent.
    pub fn require(&self, name: &str) -> Result<&'a str, HandlerError> {
        self.param(name)
            .ok_or_else(|| HandlerError::invalid_parameter(name, "missing"))
    }

    /// Queues a response to the current request.
    pub fn answer(&mut self, status: Status, parameters: Parameters) {
        let response = Response::to(self.request, self.server.next_request_id(), status)
            .with_params(parameters);
        self.replies.push(response);
    }

    /// Answers `rejected` with a `reason` parameter.
    pub fn reject(&mut self, reason: impl Into<String>) {
        self.answer(Status::Rejected, reason_param(reason));
    }

    /// Sends a notification to every authenticated client, this one included.
    pub fn broadcast(&self, kind: &str, parameters: Parameters) -> usize {
        self.server
            .broadcast(Notification::new(kind).with_params(parameters))
    }

    /// Polls `task` every `interval` until it reports it is done.
    ///
    /// The handler should answer `processing` before returning; the task then
    /// sends the final answer through its own context.
    pub fn defer(&self, interval: Duration, task: impl DeferredTask) {
        let ctx = DeferredContext::new(
            Arc::clone(self.server),
            self.client.clone(),
            self.request.clone(),
        );
        deferred::spawn(Box::new(task), ctx, interval);
    }

    pub fn into_replies(self) -> Vec<Response> {
        self.replies
    }
}

/// Context handed to response handlers.
pub struct ResponseContext<'a> {
    server: &'a Arc<Karfunkel>,
    client: &'a Client,
    response: &'a Response,
}

impl<'a> ResponseContext<'a> {
    pub fn new(server: &'a Arc<Karfunkel>, client: &'a Client, response: &'a Response) -> Self {
        Self {
            server,
            client,
            response,
        }
    }

    pub fn server(&self) -> &'a Arc<Karfunkel> {
        self.server
    }

    pub fn client(&self) -> &'a Client {
        self.client
    }

    pub fn response(&self) -> &'a Response {
        self.response
    }

    pub fn broadcast(&self, kind: &str, parameters: Parameters) -> usize {
        self.server
            .broadcast(Notification::new(kind).with_params(parameters))
    }
}

pub(crate) fn reason_param(reason: impl Into<String>) -> Parameters {
    Parameters::from([("reason".to_string(), reason.into())])
}
