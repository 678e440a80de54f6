// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node state shared by the server or agent runtime.

use crate::config::NodeConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::module::ModuleLoader;
use crate::registry::ObjectRegistry;
use crate::scheduler::Scheduler;
use crate::session::SessionManager;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Registry, sessions, module loader and scheduler of one node.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Context {
    config: Arc<NodeConfig>,
    registry: Arc<Mutex<ObjectRegistry>>,
    loader: Arc<ModuleLoader>,
    endpoint: Endpoint,
}

impl Context {
    /// Server context listening on the configured address.
    pub async fn server(config: NodeConfig, loader: ModuleLoader) -> Result<Self> {
        let bind = config.server_bind()?;
        let endpoint = Endpoint::listen(
            bind,
            config.server.domain_id,
            config.protocol.clone(),
            Scheduler::new(),
        )
        .await?;
        Ok(Self::assemble(config, loader, endpoint))
    }

    /// Agent context opening one socket per server.
    pub fn agent(config: NodeConfig, loader: ModuleLoader) -> Result<Self> {
        let endpoint = Endpoint::connector(
            config.agent_bind_ip()?,
            config.agent.domain_id,
            config.protocol.clone(),
            Scheduler::new(),
        );
        Ok(Self::assemble(config, loader, endpoint))
    }

    fn assemble(config: NodeConfig, loader: ModuleLoader, endpoint: Endpoint) -> Self {
        for (name, group) in &config.modules {
            loader.set_config(name.clone(), group.clone());
        }
        Self {
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(ObjectRegistry::new())),
            loader: Arc::new(loader),
            endpoint,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Lock the object registry. Never hold the guard across an `.await`.
    pub fn registry(&self) -> MutexGuard<'_, ObjectRegistry> {
        self.registry.lock()
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.endpoint.sessions()
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.endpoint.scheduler()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.config.name)
            .field("endpoint", &self.endpoint)
            .field("loader", &self.loader)
            .finish()
    }
}
