//! Service Discovery
//!
//! Composition root: wires the access policy, server set, group monitor
//! and singleton service from one configuration and one shared
//! coordination client.

mod monitor;
mod singleton;

pub use monitor::GroupMonitor;
pub use singleton::{SingletonHandle, SingletonService};

use std::sync::Arc;

use crate::acl::{self, AccessList};
use crate::config::DiscoveryConfig;
use crate::coordination::SharedClient;
use crate::error::Result;
use crate::path::GroupPath;
use crate::state::{LeaderElector, ServerSet};

/// Everything needed to register, discover and elect under one path
pub struct ServiceDiscovery {
    client: SharedClient,
    config: DiscoveryConfig,
    path: GroupPath,
    acl: AccessList,
    server_set: Arc<ServerSet>,
}

impl ServiceDiscovery {
    /// Validate `config` and resolve the access list once for every node
    /// created through this instance
    pub fn new(client: SharedClient, config: &DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        let path = config.serverset_path()?;
        let acl = acl::resolve(config.credentials());

        let server_set = Arc::new(ServerSet::new(
            client.clone(),
            acl.clone(),
            path.clone(),
            config.discovery.member_prefix.clone(),
            config.retry_policy(),
            config.operation_timeout(),
        ));

        tracing::info!(
            "Service discovery under {} ({} ACL)",
            path,
            if acl.is_open() { "open" } else { "creator-only" }
        );

        Ok(Self {
            client,
            config: config.clone(),
            path,
            acl,
            server_set,
        })
    }

    /// Access list applied to every created node
    pub fn acl(&self) -> &AccessList {
        &self.acl
    }

    /// Server set path
    pub fn path(&self) -> &GroupPath {
        &self.path
    }

    pub fn server_set(&self) -> Arc<ServerSet> {
        self.server_set.clone()
    }

    pub fn leader_elector(&self) -> LeaderElector {
        LeaderElector::new(
            self.client.clone(),
            self.acl.clone(),
            self.path.clone(),
            self.config.discovery.candidate_prefix.clone(),
            self.config.retry_policy(),
            self.config.operation_timeout(),
        )
    }

    pub fn group_monitor(&self) -> GroupMonitor {
        GroupMonitor::new(self.server_set.clone())
    }

    pub fn singleton_service(&self) -> SingletonService {
        SingletonService::new(
            self.leader_elector(),
            self.server_set.clone(),
            self.config.operation_timeout(),
        )
    }
}
