//! The Karfunkel server core.
//!
//! [`Karfunkel`] is shared by every connection task as an `Arc`. It owns the
//! registry of authenticated clients, the id generators, the active project
//! and the run state that tells connection tasks when to wind down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use protocol::{
    kinds, ClientId, Notification, Parameters, Request, RequestId, Response, SchemaTable, Status,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use crate::client::Client;
use crate::client_manager::ClientManager;
use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::error::ServerError;
use crate::ids::IdGenerator;
use crate::plugin::{Plugin, PluginRegistry};
use crate::plugins::{self, builtin::BuiltinPlugin};
use crate::project::Project;
use crate::shutdown::{Requester, ShutdownNegotiation, Verdict};
use crate::{lock, VERSION};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Connections close; graceful ones flush their queues first.
    Stopping { graceful: bool },
}

impl RunState {
    pub fn is_stopping(self) -> bool {
        matches!(self, Self::Stopping { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Halted,
    Aborted { rejected_by: ClientId },
    /// Another negotiation was already running, or the server is stopping.
    InProgress,
}

pub struct Karfunkel {
    config: Config,
    plugins: PluginRegistry,
    schemas: Arc<SchemaTable>,
    clients: Mutex<ClientManager>,
    client_ids: IdGenerator<ClientId>,
    request_ids: IdGenerator<RequestId>,
    project: Mutex<Option<Project>>,
    shutdown: Mutex<Option<ShutdownNegotiation>>,
    run_state: watch::Sender<RunState>,
}

impl Karfunkel {
    /// Builds a server with the plugins named in the configuration.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let plugins = plugins::resolve(&config.plugins)?;
        Self::with_plugins(config, plugins)
    }

    /// Builds a server with an explicit plugin list, loaded after the
    /// built-in core plugin and in the given order.
    pub fn with_plugins(config: Config, plugins: Vec<Box<dyn Plugin>>) -> Result<Self, ServerError> {
        config.validate()?;

        let mut registry = PluginRegistry::new();
        registry.load(&BuiltinPlugin)?;
        for plugin in &plugins {
            registry.load(plugin.as_ref())?;
        }
        let schemas = Arc::new(registry.schemas());

        let (run_state, _) = watch::channel(RunState::Running);
        Ok(Self {
            clients: Mutex::new(ClientManager::new(config.max_clients)),
            config,
            plugins: registry,
            schemas,
            client_ids: IdGenerator::new(),
            request_ids: IdGenerator::new(),
            project: Mutex::new(None),
            shutdown: Mutex::new(None),
            run_state,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn schemas(&self) -> Arc<SchemaTable> {
        Arc::clone(&self.schemas)
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn next_client_id(&self) -> ClientId {
        self.client_ids.next()
    }

    /// Ids for everything the server sends, requests and responses alike.
    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.next()
    }

    /// Builds a response to `request` with a fresh id.
    pub fn respond(&self, request: &Request, status: Status) -> Response {
        Response::to(request, self.next_request_id(), status)
    }

    pub fn run_state(&self) -> RunState {
        *self.run_state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.run_state.subscribe()
    }

    // Clients

    /// Registers an authenticated client. False if the server is full.
    pub fn admit(&self, client: &Client) -> bool {
        lock(&self.clients).add_client(client.clone())
    }

    /// Removes a client from the registry and from any running vote.
    pub fn unregister(&self, client: &Client) {
        let Some(id) = client.id() else {
            return;
        };
        lock(&self.clients).remove_client(id);
        if let Some(negotiation) = lock(&self.shutdown).as_mut() {
            negotiation.forget(id);
        }
    }

    pub fn client(&self, id: ClientId) -> Option<Client> {
        lock(&self.clients).get(id).cloned()
    }

    pub fn clients(&self) -> Vec<Client> {
        lock(&self.clients).clients()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        lock(&self.clients).ids()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Queues `notification` for every authenticated client and returns how
    /// many accepted it.
    pub fn broadcast(&self, notification: Notification) -> usize {
        let delivered = self
            .clients()
            .into_iter()
            .filter(Client::is_authenticated)
            .filter(|client| client.notify(notification.clone()))
            .count();
        debug!("Broadcast {} to {} clients", notification.kind, delivered);
        delivered
    }

    // Project

    pub fn project(&self) -> Option<Project> {
        lock(&self.project).clone()
    }

    /// Makes `project` the active one, returning the one it replaces.
    pub fn set_project(&self, project: Project) -> Option<Project> {
        info!("Project {} is now active", project.name);
        lock(&self.project).replace(project)
    }

    pub fn take_project(&self) -> Option<Project> {
        lock(&self.project).take()
    }

    // Shutdown

    pub fn is_negotiating_shutdown(&self) -> bool {
        lock(&self.shutdown).is_some()
    }

    /// Counts `client`'s answer to a `Shutdown` request.
    pub fn record_shutdown_vote(&self, client: ClientId, response: &Response) -> bool {
        match lock(&self.shutdown).as_mut() {
            Some(negotiation) => negotiation.record(client, response),
            None => false,
        }
    }

    /// Asks every authenticated client for permission to stop and halts if
    /// all of them agree.
    ///
    /// `requester`, if given, is answered `ok` right before the halt or
    /// `rejected` when a client vetoes.
    pub async fn stop(&self, requester: Option<Requester>) -> ShutdownOutcome {
        if self.run_state().is_stopping() {
            answer_requester(self, requester, Status::Rejected, "server is already stopping");
            return ShutdownOutcome::InProgress;
        }
        if let Err(requester) = self.begin_negotiation(requester) {
            answer_requester(self, requester, Status::Rejected, "a shutdown is already being negotiated");
            return ShutdownOutcome::InProgress;
        }

        let poll = self.config.shutdown_poll_interval;
        let mut ticks = time::interval_at(Instant::now() + poll, poll);
        let mut run_state = self.subscribe();

        let verdict = loop {
            if let Some(verdict) = self.shutdown_verdict() {
                break Some(verdict);
            }
            tokio::select! {
                _ = ticks.tick() => {}
                changed = run_state.changed() => {
                    if changed.is_err() || self.run_state().is_stopping() {
                        break None;
                    }
                }
            }
        };

        let requester = lock(&self.shutdown)
            .take()
            .and_then(|mut negotiation| negotiation.take_requester());

        match verdict {
            Some(Verdict::Accepted) => {
                info!("All clients agreed to shut down");
                answer_requester(self, requester, Status::Ok, "");
                self.halt(true);
                ShutdownOutcome::Halted
            }
            Some(Verdict::Vetoed(client)) => {
                info!("Client {client} rejected the shutdown, keeping the server running");
                if let Some(requester) = requester {
                    let response = self
                        .respond(&requester.request, Status::Rejected)
                        .with_param("reason", format!("client {client} rejected the shutdown"))
                        .with_param("rejected_by", client.to_string());
                    requester.client.answer(response);
                }
                ShutdownOutcome::Aborted {
                    rejected_by: client,
                }
            }
            None => ShutdownOutcome::Halted,
        }
    }

    /// Closes every connection without asking anyone.
    pub fn stop_immediately(&self) {
        info!("Stopping immediately");
        self.halt(false);
    }

    fn halt(&self, graceful: bool) {
        self.run_state.send_replace(RunState::Stopping { graceful });
    }

    fn begin_negotiation(&self, requester: Option<Requester>) -> Result<(), Option<Requester>> {
        let mut shutdown = lock(&self.shutdown);
        if shutdown.is_some() {
            return Err(requester);
        }

        let requested_by = requester
            .as_ref()
            .and_then(|requester| requester.client.id())
            .map(|id| id.to_string())
            .unwrap_or_default();
        let mut negotiation = ShutdownNegotiation::new(requester);

        for client in self.clients() {
            let Some(id) = client.id() else {
                continue;
            };
            let request = Request::new(self.next_request_id(), kinds::SHUTDOWN)
                .with_param("requester", requested_by.as_str());
            negotiation.expect(id, request.id);
            if !client.request(request) {
                negotiation.forget(id);
            }
        }

        info!("Negotiating shutdown with {} clients", negotiation.pending());
        *shutdown = Some(negotiation);
        Ok(())
    }

    fn shutdown_verdict(&self) -> Option<Verdict> {
        lock(&self.shutdown)
            .as_ref()
            .and_then(ShutdownNegotiation::verdict)
    }

    // Lifecycle

    /// Binds the configured address and serves until halted.
    pub async fn start(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.address();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Accepts connections on `listener` until the server is halted, then
    /// waits for every connection task to finish.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr().map_err(ServerError::Listener)?;
        info!("Karfunkel {} listening on {}", VERSION, local_addr);

        let mut run_state = self.subscribe();
        let mut connections = JoinSet::new();

        while !self.run_state().is_stopping() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {peer}");
                        let handler = ConnectionHandler::new(Arc::clone(&self), stream, peer);
                        connections.spawn(handler.run());
                    }
                    Err(error) => {
                        warn!("Failed to accept connection: {error}");
                        time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(error) = finished {
                        error!("Connection task failed: {error}");
                    }
                }
                changed = run_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!("Waiting for {} connections to close", connections.len());
        while let Some(finished) = connections.join_next().await {
            if let Err(error) = finished {
                error!("Connection task failed: {error}");
            }
        }
        info!("Karfunkel stopped");
        Ok(())
    }
}

fn answer_requester(server: &Karfunkel, requester: Option<Requester>, status: Status, reason: &str) {
    let Some(requester) = requester else {
        return;
    };
    let mut parameters = Parameters::new();
    if !reason.is_empty() {
        parameters.insert("reason".to_string(), reason.to_string());
    }
    let response = server.respond(&requester.request, status).with_params(parameters);
    requester.client.answer(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Outbound;
    use crate::plugin::RegistryError;
    use crate::plugin::RequestHandler;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn config() -> Config {
        Config {
            shutdown_poll_interval: Duration::from_millis(5),
            ..Config::default()
        }
    }

    fn connect(server: &Karfunkel) -> (Client, UnboundedReceiver<Outbound>) {
        let (client, inbox) = Client::new("127.0.0.1:9000".parse().unwrap());
        client.authenticate(server.next_client_id(), Some("linux"));
        assert!(server.admit(&client));
        (client, inbox)
    }

    fn shutdown_request(inbox: &mut UnboundedReceiver<Outbound>) -> Request {
        match inbox.try_recv() {
            Ok(Outbound::Request(request)) => {
                assert_eq!(request.kind, kinds::SHUTDOWN);
                request
            }
            other => panic!("expected a Shutdown request, got {other:?}"),
        }
    }

    struct Clash;

    impl Plugin for Clash {
        fn name(&self) -> &str {
            "clash"
        }

        fn register(&self, registry: &mut PluginRegistry) -> Result<(), RegistryError> {
            registry.register_request(RequestHandler::new(kinds::PING).handle(|_| Ok(())))
        }
    }

    #[test]
    fn test_new_loads_core_and_configured_plugins() {
        let server = Karfunkel::new(Config::default()).unwrap();
        assert_eq!(server.plugins().loaded(), ["core".to_string(), "projects".to_string()]);
        assert!(server.schemas().get("OpenProject").is_some());
        assert_eq!(server.run_state(), RunState::Running);
    }

    #[test]
    fn test_conflicting_plugin_fails_at_load() {
        let result = Karfunkel::with_plugins(config(), vec![Box::new(Clash)]);
        assert!(matches!(
            result,
            Err(ServerError::Registry(RegistryError::Duplicate { .. }))
        ));
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let config = Config {
            ping_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(Karfunkel::new(config.clone()), Err(ServerError::Config(_))));
        assert!(matches!(
            Karfunkel::with_plugins(config, Vec::new()),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_broadcast_reaches_only_registered_clients() {
        let server = Karfunkel::new(config()).unwrap();
        let (_first, mut first_inbox) = connect(&server);
        let (_second, mut second_inbox) = connect(&server);
        let (_stranger, mut stranger_inbox) = Client::new("127.0.0.1:9001".parse().unwrap());

        let delivered = server.broadcast(Notification::new("ProjectClosed"));

        assert_eq!(delivered, 2);
        assert!(matches!(first_inbox.try_recv(), Ok(Outbound::Notification(_))));
        assert!(matches!(second_inbox.try_recv(), Ok(Outbound::Notification(_))));
        assert!(stranger_inbox.try_recv().is_err());
    }

    #[test]
    fn test_unregister() {
        let server = Karfunkel::new(config()).unwrap();
        let (client, _inbox) = connect(&server);
        assert_eq!(server.client_count(), 1);

        server.unregister(&client);
        assert_eq!(server.client_count(), 0);
        assert!(server.client(1).is_none());
    }

    #[test]
    fn test_project_slot() {
        let server = Karfunkel::new(config()).unwrap();
        assert_eq!(server.project(), None);

        let castle = Project {
            name: "castle".into(),
            root: "/tmp/castle".into(),
        };
        assert_eq!(server.set_project(castle.clone()), None);
        assert_eq!(server.project(), Some(castle.clone()));
        assert_eq!(server.take_project(), Some(castle));
        assert_eq!(server.project(), None);
    }

    #[tokio::test]
    async fn test_stop_without_clients_halts() {
        let server = Karfunkel::new(config()).unwrap();
        assert_eq!(server.stop(None).await, ShutdownOutcome::Halted);
        assert_eq!(server.run_state(), RunState::Stopping { graceful: true });
    }

    #[tokio::test]
    async fn test_stop_with_unanimous_agreement() {
        let server = Arc::new(Karfunkel::new(config()).unwrap());
        let (first, mut first_inbox) = connect(&server);
        let (second, mut second_inbox) = connect(&server);

        let stopping = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.stop(None).await }
        });
        time::sleep(Duration::from_millis(20)).await;

        for (client, inbox) in [(&first, &mut first_inbox), (&second, &mut second_inbox)] {
            let request = shutdown_request(inbox);
            assert_eq!(request.param("requester"), Some(""));
            let vote = Response::to(&request, 500, Status::Ok);
            assert!(server.record_shutdown_vote(client.id().unwrap(), &vote));
        }

        assert_eq!(stopping.await.unwrap(), ShutdownOutcome::Halted);
        assert!(server.run_state().is_stopping());
        assert!(!server.is_negotiating_shutdown());
    }

    #[tokio::test]
    async fn test_stop_vetoed_by_one_client() {
        let server = Arc::new(Karfunkel::new(config()).unwrap());
        let (requester, mut requester_inbox) = connect(&server);
        let (objector, mut objector_inbox) = connect(&server);

        let asking = Request::new(77, kinds::SHUTDOWN);
        let stopping = tokio::spawn({
            let server = Arc::clone(&server);
            let requester = Requester {
                client: requester.clone(),
                request: asking.clone(),
            };
            async move { server.stop(Some(requester)).await }
        });
        time::sleep(Duration::from_millis(20)).await;

        let own = shutdown_request(&mut requester_inbox);
        assert_eq!(own.param("requester"), Some("1"));
        server.record_shutdown_vote(1, &Response::to(&own, 500, Status::Ok));

        let theirs = shutdown_request(&mut objector_inbox);
        server.record_shutdown_vote(
            objector.id().unwrap(),
            &Response::to(&theirs, 501, Status::Rejected),
        );

        assert_eq!(
            stopping.await.unwrap(),
            ShutdownOutcome::Aborted { rejected_by: 2 }
        );
        assert_eq!(server.run_state(), RunState::Running);

        match requester_inbox.try_recv() {
            Ok(Outbound::Response(response)) => {
                assert_eq!(response.answers, 77);
                assert_eq!(response.status, Status::Rejected);
                assert_eq!(response.param("rejected_by"), Some("2"));
            }
            other => panic!("expected the requester to be answered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_negotiation_is_refused() {
        let server = Arc::new(Karfunkel::new(config()).unwrap());
        let (_client, mut inbox) = connect(&server);

        let first = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.stop(None).await }
        });
        time::sleep(Duration::from_millis(20)).await;
        assert!(server.is_negotiating_shutdown());

        assert_eq!(server.stop(None).await, ShutdownOutcome::InProgress);

        let request = shutdown_request(&mut inbox);
        server.record_shutdown_vote(1, &Response::to(&request, 9, Status::Ok));
        assert_eq!(first.await.unwrap(), ShutdownOutcome::Halted);
    }

    #[tokio::test]
    async fn test_stop_immediately_ends_negotiation() {
        let server = Arc::new(Karfunkel::new(config()).unwrap());
        let (_client, _inbox) = connect(&server);

        let stopping = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.stop(None).await }
        });
        time::sleep(Duration::from_millis(20)).await;

        server.stop_immediately();
        assert_eq!(stopping.await.unwrap(), ShutdownOutcome::Halted);
        assert_eq!(server.run_state(), RunState::Stopping { graceful: false });
    }

    #[tokio::test]
    async fn test_run_returns_after_halt() {
        let server = Arc::new(Karfunkel::new(config()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = tokio::spawn(Arc::clone(&server).run(listener));
        time::sleep(Duration::from_millis(20)).await;
        server.stop_immediately();

        let result = time::timeout(Duration::from_secs(2), running).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
