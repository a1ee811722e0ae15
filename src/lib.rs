//! serverset - Service Registration, Discovery and Leader Election
//!
//! Lets a process advertise its endpoint under a well-known path of a
//! hierarchical, session-based coordination service so that peers can
//! discover the live set of members, and contend for exclusive leadership
//! among those peers.
//!
//! # Architecture
//!
//! Every member and candidate is an ephemeral, sequence-numbered node.
//! Membership views are rebuilt from full child listings on every watch
//! firing; the candidate holding the lowest live sequence number leads.
//! Session loss is recovered by re-registering once a new session exists.
//!
//! # Features
//!
//! - Access policy selection from optional digest credentials
//! - Server set membership with a live, push-based member view
//! - Lowest-sequence leader election with ordered, deduplicated callbacks
//! - Singleton services that publish only the current leader
//! - Automatic re-registration after session expiry
//! - In-memory coordination service for tests and simulation

pub mod acl;
pub mod config;
pub mod coordination;
pub mod discovery;
pub mod error;
pub mod instance;
pub mod path;
pub mod retry;
pub mod state;

pub use config::DiscoveryConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::acl::{AccessList, Credentials};
    pub use crate::config::DiscoveryConfig;
    pub use crate::coordination::{CoordinationClient, MemoryCoordinator, SessionEvent, SharedClient};
    pub use crate::discovery::{GroupMonitor, ServiceDiscovery, SingletonService};
    pub use crate::error::{Error, Result};
    pub use crate::instance::{Endpoint, ServiceInstance, Status};
    pub use crate::path::GroupPath;
    pub use crate::state::{LeaderElector, LeadershipState, MembershipSnapshot, ServerSet};
}
