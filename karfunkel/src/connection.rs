//! Per-connection state machine.
//!
//! One [`ConnectionHandler`] runs as one task per accepted socket. It
//! multiplexes socket reads, the client's outbound queue, the greet and
//! keepalive timers and the server's run state with `tokio::select!`:
//!
//! ```text
//! AwaitingHello --Hello--> Authenticated --close/timeout/stop--> Terminated
//!       |                                                            ^
//!       +------------- anything else / greet timeout ----------------+
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use protocol::{
    kinds, Command, FrameBuffer, ProtocolError, Request, RequestId, Response, Status, Transformer,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::client::{Client, Outbound};
use crate::plugin::{reason_param, RequestContext, ResponseContext};
use crate::server::{Karfunkel, RunState};

const READ_CHUNK: usize = 4096;

/// Type of the `error` response sent for frames that cannot be decoded.
pub const MALFORMED_COMMAND: &str = "MalformedCommand";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHello,
    Authenticated,
    Terminated,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Termination {
    #[error("peer closed the connection")]
    Closed,
    #[error("no Hello within the greet timeout")]
    GreetTimeout,
    #[error("no sign of life after a keepalive ping")]
    PingTimeout,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("server is full")]
    ServerFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("server is stopping")]
    ServerStopping,
    #[error("closed by the server")]
    Kicked,
}

pub struct ConnectionHandler<S> {
    server: Arc<Karfunkel>,
    stream: S,
    client: Client,
    outbox: mpsc::UnboundedReceiver<Outbound>,
    frames: FrameBuffer,
    transformer: Transformer,
    state: ConnectionState,
    /// The most recent keepalive ping.
    last_ping: Option<RequestId>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(server: Arc<Karfunkel>, stream: S, peer: SocketAddr) -> Self {
        let (client, outbox) = Client::new(peer);
        let frames = FrameBuffer::new(server.config().max_frame_bytes);
        let transformer = Transformer::new(server.schemas());
        Self {
            server,
            stream,
            client,
            outbox,
            frames,
            transformer,
            state: ConnectionState::AwaitingHello,
            last_ping: None,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serves the connection until it ends and reports why it did.
    pub async fn run(mut self) -> Termination {
        let config = self.server.config();
        let ping_interval = config.ping_interval;
        let ping_check_delay = config.ping_check_delay();

        let greet = time::sleep(config.greet_timeout);
        tokio::pin!(greet);
        let ping_check = time::sleep(ping_check_delay);
        tokio::pin!(ping_check);
        let mut ping_armed = false;

        let mut keepalive = time::interval_at(Instant::now() + ping_interval, ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut run_state = self.server.subscribe();
        let mut buffer = vec![0u8; READ_CHUNK];
        debug!("Serving {}", self.client);

        let reason = loop {
            if let RunState::Stopping { graceful } = self.server.run_state() {
                if graceful {
                    if let Err(reason) = self.flush_outbox().await {
                        break reason;
                    }
                }
                break Termination::ServerStopping;
            }

            tokio::select! {
                read = self.stream.read(&mut buffer) => match read {
                    Ok(0) => break Termination::Closed,
                    Ok(n) => {
                        let greeting = self.state == ConnectionState::AwaitingHello;
                        if let Err(reason) = self.receive(&buffer[..n]).await {
                            break reason;
                        }
                        if greeting && self.state == ConnectionState::Authenticated {
                            keepalive.reset();
                        }
                    }
                    Err(error) => break Termination::Io(error.to_string()),
                },
                Some(outbound) = self.outbox.recv() => {
                    if let Err(reason) = self.deliver(outbound).await {
                        break reason;
                    }
                }
                _ = &mut greet, if self.state == ConnectionState::AwaitingHello => {
                    break Termination::GreetTimeout;
                }
                _ = keepalive.tick(), if self.state == ConnectionState::Authenticated => {
                    self.send_keepalive();
                    ping_check.as_mut().reset(Instant::now() + ping_check_delay);
                    ping_armed = true;
                }
                _ = &mut ping_check, if ping_armed => {
                    ping_armed = false;
                    if !self.client.is_available() {
                        break Termination::PingTimeout;
                    }
                }
                changed = run_state.changed() => {
                    if changed.is_err() {
                        break Termination::ServerStopping;
                    }
                }
            }
        };

        self.terminate(&reason).await;
        reason
    }

    /// Buffers `bytes` and handles every frame completed by them.
    async fn receive(&mut self, bytes: &[u8]) -> Result<(), Termination> {
        self.frames.extend(bytes);
        while let Some(frame) = self.frames.next_frame()? {
            self.client.set_available(true);
            match self.state {
                ConnectionState::AwaitingHello => self.handshake(&frame).await?,
                ConnectionState::Authenticated => self.process(&frame).await?,
                ConnectionState::Terminated => break,
            }
        }
        Ok(())
    }

    async fn handshake(&mut self, frame: &[u8]) -> Result<(), Termination> {
        let command = self
            .transformer
            .decode(frame)
            .map_err(|error| Termination::Handshake(error.to_string()))?;
        let hello = match command.requests.as_slice() {
            [hello] if command.is_handshake() => hello,
            _ => {
                return Err(Termination::Handshake(
                    "the first command must be a lone Hello request".to_string(),
                ))
            }
        };
        self.transformer
            .schemas()
            .validate(hello)
            .map_err(|error| Termination::Handshake(error.to_string()))?;

        let id = self.server.next_client_id();
        self.client.authenticate(id, hello.param("os"));
        if !self.server.admit(&self.client) {
            let refusal = self
                .server
                .respond(hello, Status::Rejected)
                .with_param("reason", "server is full");
            self.write(Command::new().with_response(refusal)).await?;
            return Err(Termination::ServerFull);
        }

        self.state = ConnectionState::Authenticated;
        info!(
            "{} authenticated, running {}",
            self.client,
            hello.param("os").unwrap_or("an unknown OS")
        );

        let project = self.server.project().map(|project| project.name);
        let welcome = self
            .server
            .respond(hello, Status::Ok)
            .with_param("id", id.to_string())
            .with_param("my_version", self.server.version())
            .with_param("my_project", project.unwrap_or_default())
            .with_param("my_clients_num", self.server.client_count().to_string());
        self.write(Command::new().with_response(welcome)).await
    }

    async fn process(&mut self, frame: &[u8]) -> Result<(), Termination> {
        let command = match self.transformer.decode(frame) {
            Ok(command) => command,
            Err(error) => {
                warn!("{} sent a malformed command: {}", self.client, error);
                let response = Response {
                    id: self.server.next_request_id(),
                    kind: MALFORMED_COMMAND.to_string(),
                    answers: 0,
                    status: Status::Error,
                    parameters: reason_param(error.to_string()),
                };
                return self.write(Command::new().with_response(response)).await;
            }
        };

        if command.sender.is_some() && command.sender != self.client.id() {
            warn!("{} sent a command as client {:?}", self.client, command.sender);
        }

        let mut replies = Vec::new();
        for request in &command.requests {
            replies.extend(self.dispatch_request(request));
        }
        for response in &command.responses {
            self.dispatch_response(response);
        }
        for notification in &command.notifications {
            debug!("Ignoring {} notification from {}", notification.kind, self.client);
        }

        if replies.is_empty() {
            return Ok(());
        }
        let mut reply = Command::new();
        reply.responses = replies;
        self.write(reply).await
    }

    fn dispatch_request(&self, request: &Request) -> Vec<Response> {
        if request.is_hello() {
            let refusal = self
                .server
                .respond(request, Status::Rejected)
                .with_param("reason", "already authenticated");
            return vec![refusal];
        }

        let mut ctx = RequestContext::new(&self.server, &self.client, request);
        if let Err(error) = self.server.plugins().dispatch_request(&mut ctx) {
            debug!("Rejecting request {} from {}: {}", request.id, self.client, error);
            ctx.reject(error.to_string());
        }
        ctx.into_replies()
    }

    fn dispatch_response(&self, response: &Response) {
        if self.client.responds_to(response).is_none() {
            debug!(
                "{} answered request {} it no longer owes an answer to",
                self.client, response.answers
            );
        }

        let mut ctx = ResponseContext::new(&self.server, &self.client, response);
        if let Err(error) = self.server.plugins().dispatch_response(&mut ctx) {
            warn!("Dropping response {} from {}: {}", response.id, self.client, error);
        }
    }

    /// Sends a keepalive ping. Any frame arriving before the check counts as
    /// an answer.
    fn send_keepalive(&mut self) {
        if let Some(previous) = self.last_ping.take() {
            self.transformer.forget(previous);
            self.client.forget(previous);
        }
        self.client.set_available(false);

        let ping = Request::new(self.server.next_request_id(), kinds::PING);
        self.last_ping = Some(ping.id);
        self.client.request(ping);
    }

    async fn deliver(&mut self, outbound: Outbound) -> Result<(), Termination> {
        let command = match outbound {
            Outbound::Request(request) => Command::new().with_request(request),
            Outbound::Response(response) => Command::new().with_response(response),
            Outbound::Notification(notification) => {
                Command::new().with_notification(notification)
            }
            Outbound::Close => return Err(Termination::Kicked),
        };
        self.write(command).await
    }

    async fn flush_outbox(&mut self) -> Result<(), Termination> {
        while let Ok(outbound) = self.outbox.try_recv() {
            self.deliver(outbound).await?;
        }
        Ok(())
    }

    async fn write(&mut self, mut command: Command) -> Result<(), Termination> {
        let frame = match self.transformer.encode(&command) {
            Ok(frame) => frame,
            Err(error) if !command.responses.is_empty() => {
                warn!("Failed to encode command for {}: {}", self.client, error);
                self.replace_unsendable(&mut command.responses);
                match self.transformer.encode(&command) {
                    Ok(frame) => frame,
                    Err(error) => {
                        error!("Failed to encode command for {}: {}", self.client, error);
                        return Ok(());
                    }
                }
            }
            Err(error) => {
                error!("Failed to encode command for {}: {}", self.client, error);
                return Ok(());
            }
        };
        self.stream
            .write_all(&frame)
            .await
            .map_err(|error| Termination::Io(error.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|error| Termination::Io(error.to_string()))
    }

    /// Swaps every response that cannot be encoded for an `error` response
    /// of the same type answering the same request, so one bad reply does not
    /// take the rest of its frame down with it.
    fn replace_unsendable(&mut self, responses: &mut [Response]) {
        for response in responses.iter_mut() {
            let single = Command::new().with_response(response.clone());
            let Err(error) = self.transformer.encode(&single) else {
                continue;
            };
            warn!(
                "Replacing {} response {} to {}: {}",
                response.kind, response.id, self.client, error
            );
            *response = Response {
                id: response.id,
                kind: std::mem::take(&mut response.kind),
                answers: response.answers,
                status: Status::Error,
                parameters: reason_param(error.to_string()),
            };
        }
    }

    async fn terminate(&mut self, reason: &Termination) {
        self.state = ConnectionState::Terminated;
        if let Err(error) = self.stream.shutdown().await {
            debug!("Failed to shut down socket of {}: {}", self.client, error);
        }
        self.server.unregister(&self.client);

        match reason {
            Termination::Closed | Termination::ServerStopping | Termination::Kicked => {
                info!("Connection to {} closed: {}", self.client, reason)
            }
            _ => warn!("Dropping {}: {}", self.client, reason),
        }
    }
}
