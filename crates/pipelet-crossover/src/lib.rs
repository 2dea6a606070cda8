#![forbid(unsafe_code)]
//! pipelet-crossover: replicate the operation protocol over a transport.
//!
//! A `Crossover` node stands for the other side of a connection:
//! - operations from its inputs are sent to the remote;
//! - operations from the remote leave through its outputs;
//! - the demand of its outputs travels to the remote as query updates, and
//!   the remote's demand becomes its upstream query;
//! - fetches reaching it are answered by the remote.
//!
//! The graph is synchronous, so incoming traffic is handled by [`pump`],
//! which the runtime calls whenever the transport may have something.
//! Reconnections are classified with `same_id` and published on
//! [`Crossover::state_changes`]; resynchronizing caches is left to whoever
//! listens.

pub mod crossover;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

use serde::Deserialize;

use pipelet_operators::{OpError, Registry};

pub use crossover::{pump, ConnectionState, ConnectionStatus, Crossover, Role};
pub use error::{CrossoverError, Result};
pub use message::{Message, PROTOCOL_VERSION};
pub use session::SessionTable;
pub use transport::{memory_pair, select_transport, MemoryTransport, Transport, TransportEvent, TransportKind};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CrossoverOptions {
    /// `client` (default) or `server`.
    role: Option<String>,
    /// Defaults to the configured crossover address.
    address: Option<String>,
}

/// Register the `crossover` pipelet. Nodes built this way have no transport
/// until one is attached.
pub fn register(registry: &mut Registry) {
    registry.register("crossover", |options, config| {
        let opts: CrossoverOptions = if options.is_null() {
            CrossoverOptions::default()
        } else {
            serde_json::from_value(options.clone()).map_err(|e| OpError::options("crossover", e))?
        };
        let address = opts
            .address
            .or_else(|| config.crossover_address.clone())
            .ok_or_else(|| OpError::options("crossover", "no address given and none configured"))?;
        let node = match opts.role.as_deref() {
            None | Some("client") => Crossover::client(address),
            Some("server") => Crossover::server(address),
            Some(other) => return Err(OpError::options("crossover", format!("unknown role '{}'", other))),
        };
        Ok(Box::new(node))
    });
}
