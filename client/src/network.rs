use std::collections::VecDeque;

use log::{debug, info, warn};
use protocol::{
    kinds, ClientId, Command, FrameBuffer, Notification, Parameters, Request, RequestId,
    Response, Status, Transformer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::ClientError;

const READ_CHUNK: usize = 4096;

/// How the client votes when the server asks whether it may shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    #[default]
    Accept,
    Refuse,
}

/// What the server told us when accepting the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub id: ClientId,
    pub version: String,
    /// Name of the project open on the server, if any.
    pub project: Option<String>,
    /// Number of connected clients, this one included.
    pub clients: usize,
}

impl Welcome {
    fn from_response(response: &Response) -> Result<Self, ClientError> {
        let field = |name: &str| {
            response
                .param(name)
                .ok_or_else(|| ClientError::Handshake(format!("welcome lacks `{name}`")))
        };
        let id = field("id")?
            .parse()
            .map_err(|_| ClientError::Handshake("welcome carries an invalid id".to_string()))?;
        let clients = field("my_clients_num")?.parse().map_err(|_| {
            ClientError::Handshake("welcome carries an invalid client count".to_string())
        })?;
        let project = Some(field("my_project")?)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Ok(Self {
            id,
            version: field("my_version")?.to_string(),
            project,
            clients,
        })
    }
}

/// An authenticated connection to a Karfunkel server.
pub struct Client {
    stream: TcpStream,
    frames: FrameBuffer,
    transformer: Transformer,
    welcome: Welcome,
    next_id: RequestId,
    policy: ShutdownPolicy,
    /// Responses read while waiting for a different one.
    responses: VecDeque<Response>,
    notifications: VecDeque<Notification>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs, os: &str) -> Result<Self, ClientError> {
        Self::connect_with(addr, os, ShutdownPolicy::default()).await
    }

    /// Connects and performs the handshake.
    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        os: &str,
        policy: ShutdownPolicy,
    ) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        let mut transformer = Transformer::default();
        let mut frames = FrameBuffer::default();

        let hello = Request::new(1, kinds::HELLO).with_param("os", os);
        stream
            .write_all(&transformer.encode(&Command::new().with_request(hello))?)
            .await?;

        let welcome = loop {
            let command = read_command(&mut stream, &mut frames, &mut transformer).await?;
            let Some(response) = command.responses.into_iter().find(|r| r.answers == 1) else {
                continue;
            };
            if response.status != Status::Ok {
                let reason = response.param("reason").unwrap_or("no reason given");
                return Err(ClientError::Handshake(format!(
                    "server answered {}: {}",
                    response.status, reason
                )));
            }
            break Welcome::from_response(&response)?;
        };
        info!("Connected to Karfunkel {} as client {}", welcome.version, welcome.id);

        Ok(Self {
            stream,
            frames,
            transformer,
            welcome,
            next_id: 2,
            policy,
            responses: VecDeque::new(),
            notifications: VecDeque::new(),
        })
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    pub fn id(&self) -> ClientId {
        self.welcome.id
    }

    pub fn set_shutdown_policy(&mut self, policy: ShutdownPolicy) {
        self.policy = policy;
    }

    /// Sends a request and returns the id its response will answer.
    pub async fn send_request(
        &mut self,
        kind: &str,
        parameters: Parameters,
    ) -> Result<RequestId, ClientError> {
        let id = self.allocate_id();
        let mut request = Request::new(id, kind);
        request.parameters = parameters;
        self.send(Command::from_sender(self.welcome.id).with_request(request))
            .await?;
        Ok(id)
    }

    pub async fn send(&mut self, command: Command) -> Result<(), ClientError> {
        let frame = self.transformer.encode(&command)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Reads the next command from the server.
    ///
    /// `Ping` and `Shutdown` requests in it are answered before it is
    /// returned.
    pub async fn next_command(&mut self) -> Result<Command, ClientError> {
        let command =
            read_command(&mut self.stream, &mut self.frames, &mut self.transformer).await?;

        let mut replies = Vec::new();
        for request in &command.requests {
            if let Some(reply) = self.auto_reply(request) {
                replies.push(reply);
            }
        }
        if !replies.is_empty() {
            let mut answer = Command::from_sender(self.welcome.id);
            answer.responses = replies;
            self.send(answer).await?;
        }
        Ok(command)
    }

    /// Waits for a response to `request`. With `final_only`, interim
    /// `processing` responses are skipped.
    ///
    /// Notifications and unrelated responses read meanwhile are kept for
    /// [`take_notifications`](Self::take_notifications) and later waits.
    pub async fn wait_for_response(
        &mut self,
        request: RequestId,
        final_only: bool,
    ) -> Result<Response, ClientError> {
        let wanted = |response: &Response| {
            response.answers == request && (!final_only || response.status.is_final())
        };
        if let Some(index) = self.responses.iter().position(wanted) {
            if let Some(response) = self.responses.remove(index) {
                return Ok(response);
            }
        }

        loop {
            let command = self.next_command().await?;
            self.notifications.extend(command.notifications);
            let mut found = None;
            for response in command.responses {
                if found.is_none() && wanted(&response) {
                    found = Some(response);
                } else {
                    self.responses.push_back(response);
                }
            }
            if let Some(response) = found {
                return Ok(response);
            }
        }
    }

    /// Notifications received while waiting for responses.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// Stays connected, answering pings, until the server closes the
    /// connection.
    pub async fn serve(&mut self) -> Result<(), ClientError> {
        loop {
            match self.next_command().await {
                Ok(command) => self.notifications.extend(command.notifications),
                Err(ClientError::Closed) => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn allocate_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn auto_reply(&mut self, request: &Request) -> Option<Response> {
        let (status, reason) = match request.kind.as_str() {
            kinds::PING => (Status::Ok, None),
            kinds::SHUTDOWN => match self.policy {
                ShutdownPolicy::Accept => (Status::Ok, None),
                ShutdownPolicy::Refuse => (Status::Rejected, Some("client is busy")),
            },
            other => {
                debug!("Not answering {} request {}", other, request.id);
                return None;
            }
        };
        if request.kind == kinds::SHUTDOWN {
            info!(
                "Server asks to shut down (requested by {}), answering {}",
                request.param("requester").filter(|r| !r.is_empty()).unwrap_or("the server"),
                status
            );
        }

        let mut response = Response::to(request, self.allocate_id(), status);
        if let Some(reason) = reason {
            response = response.with_param("reason", reason);
        }
        Some(response)
    }
}

async fn read_command(
    stream: &mut TcpStream,
    frames: &mut FrameBuffer,
    transformer: &mut Transformer,
) -> Result<Command, ClientError> {
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        if let Some(frame) = frames.next_frame()? {
            match transformer.decode(&frame) {
                Ok(command) => return Ok(command),
                Err(error) => {
                    warn!("Skipping undecodable frame from server: {}", error);
                    continue;
                }
            }
        }
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        frames.extend(&buffer[..n]);
    }
}
