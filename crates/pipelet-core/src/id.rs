//! Handles for graph nodes, pending fetches, subscriptions and crossover
//! requests. Each is a plain counter wrapped in its own type so a ticket can
//! never be passed where a node is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! handle {
    ($name:ident, $tag:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "#{}"), self.0)
            }
        }
    };
}

handle!(NodeId, "node");
handle!(FetchTicket, "fetch");
handle!(SubscriptionId, "sub");
handle!(RequestId, "req");

impl NodeId {
    /// Arena slot of this node.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}
