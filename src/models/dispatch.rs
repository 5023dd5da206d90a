//! Dispatch bus envelopes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Identity;

/// Why an identity is being sent to the crawl workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchCause {
    /// A watcher saw a new or changed package
    Discovered,
    /// The reconciler found the record due for another crawl
    RecrawlDue,
}

impl fmt::Display for DispatchCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchCause::Discovered => f.write_str("discovered"),
            DispatchCause::RecrawlDue => f.write_str("recrawl_due"),
        }
    }
}

/// One unit of crawl work. Delivered at least once, in no particular order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub identity: Identity,
    pub cause: DispatchCause,
}

impl DispatchMessage {
    pub fn discovered(identity: Identity) -> Self {
        Self {
            identity,
            cause: DispatchCause::Discovered,
        }
    }

    pub fn recrawl(identity: Identity) -> Self {
        Self {
            identity,
            cause: DispatchCause::RecrawlDue,
        }
    }
}

impl fmt::Display for DispatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identity, self.cause)
    }
}
