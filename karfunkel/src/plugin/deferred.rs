//! Long-running work polled on a timer.
//!
//! A handler that cannot finish synchronously answers `processing` and hands
//! the rest to a [`DeferredTask`]. The task is polled on a fixed interval
//! until it reports [`TaskState::Done`] or the server stops.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use protocol::{Notification, Parameters, Request, Response, Status};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::context::reason_param;
use crate::client::Client;
use crate::server::Karfunkel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Done,
}

pub trait DeferredTask: Send + 'static {
    fn poll(&mut self, ctx: &mut DeferredContext) -> TaskState;
}

impl<F> DeferredTask for F
where
    F: FnMut(&mut DeferredContext) -> TaskState + Send + 'static,
{
    fn poll(&mut self, ctx: &mut DeferredContext) -> TaskState {
        self(ctx)
    }
}

/// Context of a deferred task: the request it continues and a way to answer.
pub struct DeferredContext {
    server: Arc<Karfunkel>,
    client: Client,
    request: Request,
}

impl DeferredContext {
    pub(crate) fn new(server: Arc<Karfunkel>, client: Client, request: Request) -> Self {
        Self {
            server,
            client,
            request,
        }
    }

    pub fn server(&self) -> &Arc<Karfunkel> {
        &self.server
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Sends a response to the originating request straight to the client.
    pub fn answer(&self, status: Status, parameters: Parameters) -> bool {
        let response = Response::to(&self.request, self.server.next_request_id(), status)
            .with_params(parameters);
        self.client.answer(response)
    }

    /// Answers `failed` with a `reason` parameter.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.answer(Status::Failed, reason_param(reason))
    }

    pub fn broadcast(&self, kind: &str, parameters: Parameters) -> usize {
        self.server
            .broadcast(Notification::new(kind).with_params(parameters))
    }
}

pub(crate) fn spawn(
    mut task: Box<dyn DeferredTask>,
    mut ctx: DeferredContext,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = time::interval_at(Instant::now() + every, every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut run_state = ctx.server.subscribe();

        loop {
            if run_state.borrow().is_stopping() {
                debug!("Abandoning deferred {} request {}", ctx.request.kind, ctx.request.id);
                break;
            }

            tokio::select! {
                _ = ticks.tick() => {
                    match panic::catch_unwind(AssertUnwindSafe(|| task.poll(&mut ctx))) {
                        Ok(TaskState::Pending) => {}
                        Ok(TaskState::Done) => break,
                        Err(_) => {
                            error!("Deferred {} request {} panicked", ctx.request.kind, ctx.request.id);
                            ctx.answer(Status::Error, reason_param("handler panicked"));
                            break;
                        }
                    }
                }
                changed = run_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
