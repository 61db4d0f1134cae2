//! Server-side view of one connected editor.
//!
//! A [`Client`] is a cheap, cloneable handle. The connection task owns the
//! socket; everyone else (plugins, broadcasts, the shutdown negotiation)
//! reaches the peer by pushing [`Outbound`] messages into the client's queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::debug;
use protocol::{ClientId, Notification, Request, RequestId, Response};
use tokio::sync::mpsc;

use crate::lock;

/// Messages queued for delivery by the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Request(Request),
    Response(Response),
    Notification(Notification),
    /// Flush what is queued so far, then close the connection.
    Close,
}

#[derive(Debug, Default)]
struct Session {
    id: Option<ClientId>,
    authenticated: bool,
    available: bool,
    os: Option<String>,
    /// Requests sent to this client that still await a final response.
    outstanding: Vec<Request>,
}

#[derive(Debug)]
struct Inner {
    peer: SocketAddr,
    session: Mutex<Session>,
    outbox: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Creates an unauthenticated session and the receiving end of its queue.
    pub fn new(peer: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(Inner {
                peer,
                session: Mutex::new(Session {
                    available: true,
                    ..Session::default()
                }),
                outbox,
            }),
        };
        (client, inbox)
    }

    /// Assigned during the handshake; `None` before that.
    pub fn id(&self) -> Option<ClientId> {
        lock(&self.inner.session).id
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.inner.session).authenticated
    }

    pub fn is_available(&self) -> bool {
        lock(&self.inner.session).available
    }

    pub fn set_available(&self, available: bool) {
        lock(&self.inner.session).available = available;
    }

    /// Operating system reported in the `Hello` request.
    pub fn os(&self) -> Option<String> {
        lock(&self.inner.session).os.clone()
    }

    pub fn authenticate(&self, id: ClientId, os: Option<&str>) {
        let mut session = lock(&self.inner.session);
        session.id = Some(id);
        session.authenticated = true;
        session.os = os.map(str::to_string);
    }

    /// Records `request` as outstanding and queues it for delivery.
    ///
    /// Returns false if the connection is already gone.
    pub fn request(&self, request: Request) -> bool {
        lock(&self.inner.session).outstanding.push(request.clone());
        self.deliver(Outbound::Request(request))
    }

    /// Records `response` on the outstanding request it answers and returns
    /// that request.
    ///
    /// Final responses also remove the request from the outstanding list.
    /// An unknown id yields `None`, which callers treat as a stale answer.
    pub fn responds_to(&self, response: &Response) -> Option<Request> {
        let mut session = lock(&self.inner.session);
        let index = session
            .outstanding
            .iter()
            .position(|request| request.id == response.answers)?;

        session.outstanding[index].responses.push(response.clone());
        if response.status.is_final() {
            Some(session.outstanding.remove(index))
        } else {
            Some(session.outstanding[index].clone())
        }
    }

    /// Drops an outstanding request without waiting for its answer.
    pub fn forget(&self, request_id: RequestId) -> Option<Request> {
        let mut session = lock(&self.inner.session);
        let index = session
            .outstanding
            .iter()
            .position(|request| request.id == request_id)?;
        Some(session.outstanding.remove(index))
    }

    pub fn outstanding(&self) -> Vec<RequestId> {
        lock(&self.inner.session)
            .outstanding
            .iter()
            .map(|request| request.id)
            .collect()
    }

    pub fn answer(&self, response: Response) -> bool {
        self.deliver(Outbound::Response(response))
    }

    pub fn notify(&self, notification: Notification) -> bool {
        self.deliver(Outbound::Notification(notification))
    }

    /// Asks the connection task to flush and hang up.
    pub fn close(&self) -> bool {
        self.deliver(Outbound::Close)
    }

    fn deliver(&self, outbound: Outbound) -> bool {
        match self.inner.outbox.send(outbound) {
            Ok(()) => true,
            Err(_) => {
                debug!("{self} is gone, dropping outbound message");
                false
            }
        }
    }
}

/// Authenticated clients are equal by id; before that only a handle is equal
/// to its own clones.
impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        match (self.id(), other.id()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => Arc::ptr_eq(&self.inner, &other.inner),
        }
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "client {id} ({})", self.inner.peer),
            None => write!(f, "unauthenticated client ({})", self.inner.peer),
        }
    }
}
