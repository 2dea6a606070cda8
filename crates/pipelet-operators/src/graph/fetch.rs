//! Fetch frames.
//!
//! A fetch is a tree: the root frame belongs to the requester, every other
//! frame to a node the fetch passed through. Values travel up the tree,
//! filtered by each frame's query and transformed by each parent node, until
//! the root hands them out in chunks. A frame completes when all its children
//! have; the root then delivers its final chunk with `no_more`.
//!
//! A node already on the path of a frame answers empty, so cycles terminate.

use std::collections::HashMap;

use tracing::{trace, warn};

use pipelet_core::id::{FetchTicket, NodeId};
use pipelet_core::value::Value;
use pipelet_query::{compile, Matcher, Query};

use super::{Graph, Inflight, Step};
use crate::traits::{Chunk, FetchPlan, Result};

/// Who receives the chunks of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    /// Chunks are collected under the ticket; see [`Graph::poll_fetch`].
    External,
    /// Chunks go to the node's `receive_fetched`; pushes to the node are held
    /// back until the last chunk.
    Node(NodeId),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    pub chunks: Vec<Vec<Value>>,
    pub complete: bool,
}

struct Root {
    ticket: FetchTicket,
    requester: Requester,
    held: Option<Vec<Value>>,
}

struct Frame {
    parent: Option<usize>,
    node: Option<NodeId>,
    matcher: Matcher,
    pending: usize,
    root: Option<Root>,
}

#[derive(Default)]
pub(crate) struct FetchState {
    frames: Vec<Option<Frame>>,
    free: Vec<usize>,
    pub(crate) deferred: HashMap<FetchTicket, usize>,
    pub(crate) results: HashMap<FetchTicket, FetchResult>,
}

impl FetchState {
    fn alloc(&mut self, frame: Frame) -> usize {
        match self.free.pop() {
            Some(i) => {
                self.frames[i] = Some(frame);
                i
            }
            None => {
                self.frames.push(Some(frame));
                self.frames.len() - 1
            }
        }
    }

    fn frame(&self, i: usize) -> Option<&Frame> {
        self.frames.get(i).and_then(Option::as_ref)
    }

    fn frame_mut(&mut self, i: usize) -> Option<&mut Frame> {
        self.frames.get_mut(i).and_then(Option::as_mut)
    }

    fn on_path(&self, mut at: usize, node: NodeId) -> bool {
        while let Some(f) = self.frame(at) {
            if f.node == Some(node) {
                return true;
            }
            match f.parent {
                Some(p) => at = p,
                None => break,
            }
        }
        false
    }
}

impl Graph {
    pub(crate) fn start_fetch(
        &mut self,
        requester: Requester,
        path_node: Option<NodeId>,
        targets: Vec<NodeId>,
        query: &Query,
    ) -> Result<FetchTicket> {
        let matcher = compile(query)?;
        let ticket = FetchTicket::new(self.next_seq());
        match requester {
            Requester::External => {
                self.fetch.results.insert(ticket, FetchResult::default());
            }
            Requester::Node(n) => {
                self.inflight.entry(n).or_insert_with(Inflight::default).fetches += 1;
            }
        }
        trace!(ticket = %ticket, query = %query, targets = targets.len(), "fetch started");
        let root = self.fetch.alloc(Frame {
            parent: None,
            node: path_node,
            matcher,
            pending: targets.len(),
            root: Some(Root {
                ticket,
                requester,
                held: None,
            }),
        });
        if targets.is_empty() {
            self.frame_done(root);
        }
        for target in targets {
            self.spawn_frame(root, target, query);
        }
        Ok(ticket)
    }

    fn spawn_frame(&mut self, parent: usize, node: NodeId, query: &Query) {
        if self.fetch.on_path(parent, node) {
            trace!(node = %node, "fetch cycle answered empty");
            self.child_done(parent);
            return;
        }
        let matcher = match compile(query) {
            Ok(m) => m,
            Err(e) => {
                warn!(node = %node, error = %e, "fetch query rejected");
                self.child_done(parent);
                return;
            }
        };
        let ticket = FetchTicket::new(self.next_seq());
        let plan = match self.slot_mut(node).and_then(|s| s.pipelet.as_mut()) {
            Some(p) => p.fetch_plan(query, ticket),
            None => {
                // absent or detached sources answer empty
                self.child_done(parent);
                return;
            }
        };
        let f = self.fetch.alloc(Frame {
            parent: Some(parent),
            node: Some(node),
            matcher,
            pending: 0,
            root: None,
        });
        match plan {
            FetchPlan::Serve(values) => {
                let size = self.config.chunk_size();
                let mut values = values.into_iter().peekable();
                while values.peek().is_some() {
                    let chunk: Vec<Value> = values.by_ref().take(size).collect();
                    self.emit_up(f, chunk);
                }
                self.frame_done(f);
            }
            FetchPlan::Upstream(q) => {
                let inputs = self.inputs(node).to_vec();
                if let Some(frame) = self.fetch.frame_mut(f) {
                    frame.pending = inputs.len();
                }
                if inputs.is_empty() {
                    self.frame_done(f);
                }
                for input in inputs {
                    self.spawn_frame(f, input, &q);
                }
            }
            FetchPlan::Deferred => {
                if let Some(frame) = self.fetch.frame_mut(f) {
                    frame.pending = 1;
                }
                self.fetch.deferred.insert(ticket, f);
                trace!(node = %node, ticket = %ticket, "fetch deferred");
            }
        }
    }

    /// `values` are the output of frame `f`'s node.
    fn emit_up(&mut self, mut f: usize, mut values: Vec<Value>) {
        loop {
            let Some(frame) = self.fetch.frame(f) else {
                return;
            };
            values.retain(|v| frame.matcher.matches(v));
            if values.is_empty() {
                return;
            }
            if frame.root.is_some() {
                self.root_receive(f, values);
                return;
            }
            let Some(p) = frame.parent else {
                return;
            };
            let parent_node = self
                .fetch
                .frame(p)
                .filter(|pf| pf.root.is_none())
                .and_then(|pf| pf.node);
            if let Some(node) = parent_node {
                if let Some(pl) = self.slot(node).and_then(|s| s.pipelet.as_ref()) {
                    values = pl.transform_fetched(values);
                }
            }
            f = p;
        }
    }

    fn root_receive(&mut self, f: usize, values: Vec<Value>) {
        let size = self.config.chunk_size();
        let mut values = values.into_iter().peekable();
        while values.peek().is_some() {
            let chunk: Vec<Value> = values.by_ref().take(size).collect();
            let Some(root) = self.fetch.frame_mut(f).and_then(|fr| fr.root.as_mut()) else {
                return;
            };
            let (ticket, requester) = (root.ticket, root.requester);
            if let Some(previous) = root.held.replace(chunk) {
                self.hand_out(ticket, requester, previous, false);
            }
        }
    }

    fn hand_out(&mut self, ticket: FetchTicket, requester: Requester, values: Vec<Value>, no_more: bool) {
        match requester {
            Requester::External => {
                if let Some(result) = self.fetch.results.get_mut(&ticket) {
                    if !values.is_empty() {
                        result.chunks.push(values);
                    }
                    result.complete = no_more;
                }
            }
            Requester::Node(node) => self.queue.push_back(Step::Fetched {
                node,
                chunk: Chunk { values, no_more },
            }),
        }
        if no_more {
            trace!(ticket = %ticket, "fetch complete");
        }
    }

    fn frame_done(&mut self, f: usize) {
        let Some(frame) = self.fetch.frames.get_mut(f).and_then(Option::take) else {
            return;
        };
        self.fetch.free.push(f);
        if let Some(root) = frame.root {
            let last = root.held.unwrap_or_default();
            self.hand_out(root.ticket, root.requester, last, true);
            return;
        }
        if let Some(p) = frame.parent {
            self.child_done(p);
        }
    }

    fn child_done(&mut self, parent: usize) {
        let remaining = match self.fetch.frame_mut(parent) {
            Some(frame) => {
                frame.pending = frame.pending.saturating_sub(1);
                frame.pending
            }
            None => return,
        };
        if remaining == 0 {
            self.frame_done(parent);
        }
    }

    pub(crate) fn resolve_deferred(&mut self, ticket: FetchTicket, values: Vec<Value>, no_more: bool) {
        let Some(&f) = self.fetch.deferred.get(&ticket) else {
            warn!(ticket = %ticket, "chunk for an unknown deferred fetch");
            return;
        };
        let size = self.config.chunk_size();
        let mut values = values.into_iter().peekable();
        while values.peek().is_some() {
            let chunk: Vec<Value> = values.by_ref().take(size).collect();
            self.emit_up(f, chunk);
        }
        if no_more {
            self.fetch.deferred.remove(&ticket);
            self.frame_done(f);
        }
    }
}
