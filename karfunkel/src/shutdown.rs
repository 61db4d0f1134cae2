//! Vote tally for a graceful shutdown.
//!
//! Every authenticated client gets a `Shutdown` request. The server halts
//! only once all of them answered `ok`; a single other final answer vetoes.

use std::collections::HashMap;

use protocol::{ClientId, Request, RequestId, Response, Status};

use crate::client::Client;

/// The client whose `Shutdown` request started a negotiation.
#[derive(Debug, Clone)]
pub struct Requester {
    pub client: Client,
    pub request: Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Vetoed(ClientId),
}

#[derive(Debug)]
pub struct ShutdownNegotiation {
    requester: Option<Requester>,
    /// Clients yet to vote, with the id of the request they must answer.
    pending: HashMap<ClientId, RequestId>,
    rejected_by: Option<ClientId>,
}

impl ShutdownNegotiation {
    pub fn new(requester: Option<Requester>) -> Self {
        Self {
            requester,
            pending: HashMap::new(),
            rejected_by: None,
        }
    }

    pub fn take_requester(&mut self) -> Option<Requester> {
        self.requester.take()
    }

    pub fn expect(&mut self, client: ClientId, request: RequestId) {
        self.pending.insert(client, request);
    }

    /// Records `client`'s answer. Returns false if it was not a vote this
    /// negotiation is waiting for.
    pub fn record(&mut self, client: ClientId, response: &Response) -> bool {
        if self.pending.get(&client) != Some(&response.answers) {
            return false;
        }
        match response.status {
            Status::Processing => return true,
            Status::Ok => {}
            _ => {
                self.rejected_by.get_or_insert(client);
            }
        }
        self.pending.remove(&client);
        true
    }

    /// A client that disconnects no longer has a say.
    pub fn forget(&mut self, client: ClientId) {
        self.pending.remove(&client);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn verdict(&self) -> Option<Verdict> {
        if let Some(client) = self.rejected_by {
            return Some(Verdict::Vetoed(client));
        }
        self.pending.is_empty().then_some(Verdict::Accepted)
    }
}
