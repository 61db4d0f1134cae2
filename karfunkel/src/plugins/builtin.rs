//! The `core` plugin: keepalive answers, shutdown negotiation and client
//! listing.

use std::sync::Arc;

use log::debug;
use protocol::{kinds, Parameters, Status};

use crate::plugin::{
    HandlerError, Plugin, PluginRegistry, RegistryError, RequestContext, RequestHandler,
    ResponseContext, ResponseHandler,
};
use crate::shutdown::Requester;

pub const CLIENT_LIST: &str = "ClientList";

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPlugin;

impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        super::CORE
    }

    fn register(&self, registry: &mut PluginRegistry) -> Result<(), RegistryError> {
        registry.register_request(RequestHandler::new(kinds::PING).handle(ping))?;
        registry.register_request(
            RequestHandler::new(kinds::SHUTDOWN)
                .optional("requester", "")
                .handle(shutdown),
        )?;
        registry.register_request(RequestHandler::new(CLIENT_LIST).handle(client_list))?;

        registry.register_response(ResponseHandler::new(kinds::PING).handle(|_| Ok(())))?;
        registry.register_response(ResponseHandler::new(kinds::SHUTDOWN).handle(shutdown_vote))?;
        Ok(())
    }
}

fn ping(ctx: &mut RequestContext<'_>) -> Result<(), HandlerError> {
    ctx.answer(Status::Ok, Parameters::new());
    Ok(())
}

/// A client asks the server to stop. The negotiation runs in the background;
/// the client hears back once it is decided.
fn shutdown(ctx: &mut RequestContext<'_>) -> Result<(), HandlerError> {
    ctx.answer(Status::Processing, Parameters::new());

    let server = Arc::clone(ctx.server());
    let requester = Requester {
        client: ctx.client().clone(),
        request: ctx.request().clone(),
    };
    tokio::spawn(async move {
        let outcome = server.stop(Some(requester)).await;
        debug!("Requested shutdown ended with {outcome:?}");
    });
    Ok(())
}

fn client_list(ctx: &mut RequestContext<'_>) -> Result<(), HandlerError> {
    let ids = ctx.server().client_ids();
    let listed = ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut parameters = Parameters::new();
    parameters.insert("count".to_string(), ids.len().to_string());
    parameters.insert("ids".to_string(), listed);
    ctx.answer(Status::Ok, parameters);
    Ok(())
}

fn shutdown_vote(ctx: &mut ResponseContext<'_>) -> Result<(), HandlerError> {
    let Some(client) = ctx.client().id() else {
        return Ok(());
    };
    if !ctx.server().record_shutdown_vote(client, ctx.response()) {
        debug!("Ignoring shutdown vote of client {client}, nothing is being negotiated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, Outbound};
    use crate::config::Config;
    use crate::server::Karfunkel;
    use protocol::{Request, Response};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn server() -> Arc<Karfunkel> {
        let config = Config {
            shutdown_poll_interval: Duration::from_millis(5),
            ..Config::default()
        };
        Arc::new(Karfunkel::new(config).unwrap())
    }

    fn connect(server: &Karfunkel) -> (Client, UnboundedReceiver<Outbound>) {
        let (client, inbox) = Client::new("127.0.0.1:9000".parse().unwrap());
        client.authenticate(server.next_client_id(), Some("linux"));
        server.admit(&client);
        (client, inbox)
    }

    fn dispatch(server: &Arc<Karfunkel>, client: &Client, request: &Request) -> Vec<Response> {
        let mut ctx = RequestContext::new(server, client, request);
        server.plugins().dispatch_request(&mut ctx).unwrap();
        ctx.into_replies()
    }

    #[test]
    fn test_ping_is_answered_ok() {
        let server = server();
        let (client, _inbox) = connect(&server);

        let replies = dispatch(&server, &client, &Request::new(4, kinds::PING));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status, Status::Ok);
        assert_eq!(replies[0].answers, 4);
        assert_eq!(replies[0].kind, kinds::PING);
    }

    #[test]
    fn test_client_list() {
        let server = server();
        let (client, _a) = connect(&server);
        let (_other, _b) = connect(&server);

        let replies = dispatch(&server, &client, &Request::new(1, CLIENT_LIST));
        assert_eq!(replies[0].param("count"), Some("2"));
        assert_eq!(replies[0].param("ids"), Some("1,2"));
    }

    #[tokio::test]
    async fn test_shutdown_request_runs_negotiation() {
        let server = server();
        let (client, mut inbox) = connect(&server);

        let request = Request::new(8, kinds::SHUTDOWN);
        let replies = dispatch(&server, &client, &request);
        assert_eq!(replies[0].status, Status::Processing);

        let vote = match tokio::time::timeout(Duration::from_secs(1), inbox.recv()).await {
            Ok(Some(Outbound::Request(vote))) => vote,
            other => panic!("expected a Shutdown request, got {other:?}"),
        };
        assert_eq!(vote.param("requester"), Some("1"));

        let answer = Response::to(&vote, 3, Status::Ok);
        let mut ctx = ResponseContext::new(&server, &client, &answer);
        server.plugins().dispatch_response(&mut ctx).unwrap();

        match tokio::time::timeout(Duration::from_secs(1), inbox.recv()).await {
            Ok(Some(Outbound::Response(response))) => {
                assert_eq!(response.answers, 8);
                assert_eq!(response.status, Status::Ok);
            }
            other => panic!("expected the final answer, got {other:?}"),
        }
        assert!(server.run_state().is_stopping());
    }

    #[test]
    fn test_vote_without_negotiation_is_ignored() {
        let server = server();
        let (client, _inbox) = connect(&server);

        let answer = Response::to(&Request::new(1, kinds::SHUTDOWN), 2, Status::Rejected);
        let mut ctx = ResponseContext::new(&server, &client, &answer);
        assert!(server.plugins().dispatch_response(&mut ctx).is_ok());
        assert!(!server.is_negotiating_shutdown());
        assert!(!server.run_state().is_stopping());
    }
}
