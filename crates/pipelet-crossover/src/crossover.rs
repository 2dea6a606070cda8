//! The crossover pipelet and its connection state machine.
//!
//! ```text
//! Disconnected --open--> Connecting --handshake--> Connected
//!       ^                                               |
//!       +--------------------closed---------------------+
//! ```
//!
//! The client offers the session id it had; the server answers with the id it
//! assigns. `same_id` compares the two: `None` on a first connection,
//! `Some(true)` on a soft reconnect (the remote kept its state), `Some(false)`
//! on a hard one (the remote forgot it; demand is resubmitted and stateful
//! consumers should resync).

use std::any::Any;
use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use pipelet_core::id::{FetchTicket, NodeId, RequestId};
use pipelet_core::operation::Operation;
use pipelet_operators::{Ctx, FetchPlan, Graph, OpError, Pipelet};
use pipelet_query::{Query, QueryChanges, QueryUnion};

use crate::error::{CrossoverError, Result};
use crate::message::{Message, PROTOCOL_VERSION};
use crate::session::SessionTable;
use crate::transport::{Transport, TransportEvent};

const STATUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub address: String,
    /// Session id once a handshake completed.
    pub id: Option<String>,
    pub state: ConnectionState,
    pub same_id: Option<bool>,
    pub error: Option<String>,
}

impl ConnectionStatus {
    /// Connected to a remote that lost our session.
    pub fn is_hard_reconnect(&self) -> bool {
        self.state == ConnectionState::Connected && self.same_id == Some(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens the handshake and keeps its session id across connections.
    Client,
    /// Answers handshakes and assigns session ids.
    Server,
}

pub struct Crossover {
    role: Role,
    status: ConnectionStatus,
    transport: Option<Box<dyn Transport>>,
    sessions: SessionTable,
    remote_demand: QueryUnion,
    outbox: VecDeque<Message>,
    requests: HashMap<RequestId, FetchTicket>,
    serving: Vec<(RequestId, FetchTicket)>,
    next_request: u64,
    changes: broadcast::Sender<ConnectionStatus>,
}

impl Crossover {
    pub fn client(address: impl Into<String>) -> Self {
        Self::new(Role::Client, address.into())
    }

    pub fn server(address: impl Into<String>) -> Self {
        Self::new(Role::Server, address.into())
    }

    fn new(role: Role, address: String) -> Self {
        let (changes, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            role,
            status: ConnectionStatus {
                address,
                id: None,
                state: ConnectionState::Disconnected,
                same_id: None,
                error: None,
            },
            transport: None,
            sessions: SessionTable::new(),
            remote_demand: QueryUnion::new(),
            outbox: VecDeque::new(),
            requests: HashMap::new(),
            serving: Vec::new(),
            next_request: 1,
            changes,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> &str {
        &self.status.address
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.state == ConnectionState::Connected
    }

    /// Every status change, in order. Lagging receivers lose the oldest.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.changes.subscribe()
    }

    /// Operations and query updates waiting for a connection.
    pub fn buffered(&self) -> usize {
        self.outbox.len()
    }

    /// What the remote currently asks of this side.
    pub fn remote_demand(&self) -> Query {
        self.remote_demand.query()
    }

    /// Use `transport` from now on. An open previous transport is closed
    /// first; its `Closed` event is not reported.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        if let Some(mut old) = self.transport.take() {
            old.close();
        }
        debug!(address = %self.status.address, kind = transport.kind().name(), "transport attached");
        self.status.state = ConnectionState::Disconnected;
        self.transport = Some(transport);
    }

    /// Close the connection; reported by the next pump.
    pub fn disconnect(&mut self) {
        if let Some(t) = self.transport.as_mut() {
            t.close();
        }
    }

    fn publish(&self, out: &mut Vec<ConnectionStatus>) {
        debug!(
            address = %self.status.address,
            state = ?self.status.state,
            same_id = ?self.status.same_id,
            "connection state changed"
        );
        // no receivers is fine
        let _ = self.changes.send(self.status.clone());
        out.push(self.status.clone());
    }

    fn send_now(&mut self, msg: &Message) -> bool {
        let Some(t) = self.transport.as_mut() else {
            return false;
        };
        match msg.encode().and_then(|frame| t.send(frame)) {
            Ok(()) => true,
            Err(e) => {
                warn!(address = %self.status.address, error = %e, "send failed");
                false
            }
        }
    }

    /// Send, or buffer while not connected.
    fn send(&mut self, msg: Message) {
        if self.is_connected() && self.send_now(&msg) {
            return;
        }
        if msg.is_replayable() {
            trace!(address = %self.status.address, "buffered while disconnected");
            self.outbox.push_back(msg);
        }
    }

    fn flush_outbox(&mut self) {
        if !self.outbox.is_empty() {
            debug!(address = %self.status.address, count = self.outbox.len(), "resubmitting buffered messages");
        }
        while let Some(msg) = self.outbox.pop_front() {
            if !self.send_now(&msg) {
                self.outbox.push_front(msg);
                break;
            }
        }
    }

    fn pump_with(&mut self, graph: &mut Graph, me: NodeId) -> Vec<ConnectionStatus> {
        let mut changes = Vec::new();
        while let Some(event) = self.transport.as_mut().and_then(|t| t.poll()) {
            match event {
                TransportEvent::Open => self.on_open(&mut changes),
                TransportEvent::Frame(frame) => match Message::decode(&frame) {
                    Ok(msg) => self.on_message(graph, me, msg, &mut changes),
                    Err(e) => warn!(address = %self.status.address, error = %e, "dropping malformed frame"),
                },
                TransportEvent::Closed => self.on_closed(graph, &mut changes),
            }
        }
        self.serve_fetches(graph);
        changes
    }

    fn on_open(&mut self, changes: &mut Vec<ConnectionStatus>) {
        self.status.state = ConnectionState::Connecting;
        self.status.same_id = None;
        self.status.error = None;
        if self.role == Role::Client {
            let offered = self.status.id.clone();
            self.send_now(&Message::handshake(offered));
        }
        self.publish(changes);
    }

    fn on_message(&mut self, graph: &mut Graph, me: NodeId, msg: Message, changes: &mut Vec<ConnectionStatus>) {
        match msg {
            Message::Handshake { id, protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    if self.role == Role::Server {
                        self.send_now(&Message::handshake(None));
                    }
                    self.protocol_error(protocol_version);
                    return;
                }
                match self.role {
                    Role::Client => self.client_handshake(graph, me, id, changes),
                    Role::Server => self.server_handshake(graph, me, id, changes),
                }
            }
            Message::Operation { operation } => {
                trace!(address = %self.status.address, op = %operation, "remote operation");
                if let Err(e) = graph.emit_from(me, operation) {
                    error!(node = %me, error = %e, "remote operation failed");
                }
            }
            Message::QueryUpdate { removes, adds } => {
                let net = self.remote_demand.apply(&QueryChanges::new(removes, adds));
                if net.is_empty() {
                    return;
                }
                debug!(node = %me, demand = %self.remote_demand.query(), "remote demand changed");
                if let Err(e) = graph.set_upstream(me, self.remote_demand.query()) {
                    error!(node = %me, error = %e, "remote query update failed");
                }
            }
            Message::Fetch { request, query } => match graph.fetch_inputs(me, &query) {
                Ok(ticket) => self.serving.push((request, ticket)),
                Err(e) => {
                    warn!(node = %me, error = %e, "remote fetch failed, answering empty");
                    self.send_now(&Message::FetchChunk {
                        request,
                        values: Vec::new(),
                        no_more: true,
                    });
                }
            },
            Message::FetchChunk {
                request,
                values,
                no_more,
            } => {
                let Some(&ticket) = self.requests.get(&request) else {
                    warn!(node = %me, request = %request, "chunk for an unknown request");
                    return;
                };
                if no_more {
                    self.requests.remove(&request);
                }
                if let Err(e) = graph.resolve_fetch(ticket, values, no_more) {
                    error!(node = %me, error = %e, "delivering remote chunk failed");
                }
            }
        }
    }

    fn client_handshake(&mut self, graph: &Graph, me: NodeId, id: Option<String>, changes: &mut Vec<ConnectionStatus>) {
        let Some(id) = id else {
            error!(address = %self.status.address, "handshake without a session id");
            self.status.error = Some("handshake without a session id".to_string());
            self.disconnect();
            return;
        };
        let same_id = self.status.id.as_ref().map(|prev| *prev == id);
        self.status.id = Some(id);
        self.status.same_id = same_id;
        self.status.state = ConnectionState::Connected;
        if same_id != Some(true) {
            self.resubmit_demand(graph, me);
        }
        self.flush_outbox();
        self.publish(changes);
    }

    fn server_handshake(
        &mut self,
        graph: &mut Graph,
        me: NodeId,
        offered: Option<String>,
        changes: &mut Vec<ConnectionStatus>,
    ) {
        let (id, known) = self.sessions.resolve(offered.as_deref());
        if !known {
            // the client starts over: forget what the previous session asked for
            self.outbox.clear();
            if !self.remote_demand.is_empty() {
                self.remote_demand = QueryUnion::new();
                if let Err(e) = graph.set_upstream(me, Query::nothing()) {
                    error!(node = %me, error = %e, "resetting remote demand failed");
                }
            }
        }
        self.send_now(&Message::handshake(Some(id.clone())));
        self.status.id = Some(id);
        self.status.same_id = offered.map(|_| known);
        self.status.state = ConnectionState::Connected;
        self.flush_outbox();
        self.publish(changes);
    }

    /// Replace buffered query updates by the whole current demand.
    fn resubmit_demand(&mut self, graph: &Graph, me: NodeId) {
        self.outbox.retain(|m| !matches!(m, Message::QueryUpdate { .. }));
        let demand = graph.demand(me).unwrap_or_default();
        if demand.is_empty() {
            return;
        }
        debug!(node = %me, demand = %demand, "resubmitting demand");
        self.send_now(&Message::QueryUpdate {
            removes: Vec::new(),
            adds: demand.into_terms(),
        });
    }

    fn protocol_error(&mut self, remote: u32) {
        let e = CrossoverError::Protocol {
            local: PROTOCOL_VERSION,
            remote,
        };
        error!(address = %self.status.address, error = %e, "closing connection");
        self.status.error = Some(e.to_string());
        self.disconnect();
    }

    fn on_closed(&mut self, graph: &mut Graph, changes: &mut Vec<ConnectionStatus>) {
        self.transport = None;
        self.status.state = ConnectionState::Disconnected;
        self.status.same_id = None;
        for (request, ticket) in std::mem::take(&mut self.requests) {
            trace!(request = %request, "answering pending fetch empty");
            if let Err(e) = graph.resolve_fetch(ticket, Vec::new(), true) {
                warn!(error = %e, "resolving a pending fetch failed");
            }
        }
        self.serving.clear();
        self.publish(changes);
    }

    fn serve_fetches(&mut self, graph: &mut Graph) {
        let mut waiting = Vec::new();
        for (request, ticket) in std::mem::take(&mut self.serving) {
            let Some(result) = graph.poll_fetch(ticket) else {
                self.send_now(&Message::FetchChunk {
                    request,
                    values: Vec::new(),
                    no_more: true,
                });
                continue;
            };
            let complete = result.complete;
            let n = result.chunks.len();
            for (i, values) in result.chunks.into_iter().enumerate() {
                self.send_now(&Message::FetchChunk {
                    request,
                    values,
                    no_more: complete && i + 1 == n,
                });
            }
            if !complete {
                waiting.push((request, ticket));
            } else if n == 0 {
                self.send_now(&Message::FetchChunk {
                    request,
                    values: Vec::new(),
                    no_more: true,
                });
            }
        }
        self.serving = waiting;
    }
}

/// Handle everything the crossover at `node` has received, returning the
/// status changes it went through.
pub fn pump(graph: &mut Graph, node: NodeId) -> Result<Vec<ConnectionStatus>> {
    graph.drive(node, |p, g| match p.as_any_mut().downcast_mut::<Crossover>() {
        Some(c) => Ok(c.pump_with(g, node)),
        None => Err(CrossoverError::Graph(OpError::Graph(format!(
            "{} is not a crossover",
            node
        )))),
    })?
}

impl Pipelet for Crossover {
    fn name(&self) -> &str {
        "crossover"
    }

    fn upstream_query(&self, _downstream: &Query) -> Query {
        self.remote_demand.query()
    }

    fn downstream_changed(&mut self, _demand: &Query, net: &QueryChanges) {
        self.send(Message::QueryUpdate {
            removes: net.removes.clone(),
            adds: net.adds.clone(),
        });
    }

    fn listen(&mut self, op: Operation, _ctx: &mut Ctx<'_>) -> pipelet_operators::Result<Vec<Operation>> {
        self.send(Message::Operation { operation: op });
        Ok(Vec::new())
    }

    fn fetch_plan(&mut self, query: &Query, ticket: FetchTicket) -> FetchPlan {
        if !self.is_connected() {
            debug!(address = %self.status.address, "fetch while disconnected answered empty");
            return FetchPlan::Serve(Vec::new());
        }
        let request = RequestId::new(self.next_request);
        self.next_request += 1;
        let sent = self.send_now(&Message::Fetch {
            request,
            query: query.clone(),
        });
        if !sent {
            return FetchPlan::Serve(Vec::new());
        }
        self.requests.insert(request, ticket);
        FetchPlan::Deferred
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
