//! One supervised driver task per (user, site) agent.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::scheduler::{Agent, AgentDeps};
use crate::site::SiteRegistry;
use crate::store;

struct AgentHandle {
    agent: Arc<Agent>,
    task: JoinHandle<()>,
}

/// Owns every running agent in the process.
///
/// Agents are created on first use, restored from the store before their
/// driver starts, and respawned if their driver task died.
#[derive(Clone)]
pub struct AgentHub {
    deps: AgentDeps,
    sites: Arc<SiteRegistry>,
    agents: Arc<RwLock<HashMap<(String, String), AgentHandle>>>,
}

impl AgentHub {
    /// Create a new hub with no running agents.
    pub fn new(deps: AgentDeps, sites: Arc<SiteRegistry>) -> Self {
        Self {
            deps,
            sites,
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The running agent for (user, site), starting it if needed.
    pub async fn get_or_spawn(&self, user_id: &str, site_id: &str) -> Result<Arc<Agent>> {
        let key = (user_id.to_string(), site_id.to_string());
        {
            let agents = self.agents.read().await;
            if let Some(handle) = agents.get(&key) {
                if !handle.task.is_finished() {
                    return Ok(handle.agent.clone());
                }
            }
        }

        let adapter = self
            .sites
            .get(site_id)
            .ok_or_else(|| anyhow!("unknown site '{}'", site_id))?;

        let mut agents = self.agents.write().await;
        if let Some(handle) = agents.get(&key) {
            if !handle.task.is_finished() {
                return Ok(handle.agent.clone());
            }
            warn!("Hub: driver for {}:{} stopped, restarting", user_id, site_id);
        }

        let agent = Arc::new(Agent::load(user_id, adapter, &self.deps).await?);
        let task = tokio::spawn(agent.clone().run());
        agents.insert(
            key,
            AgentHandle {
                agent: agent.clone(),
                task,
            },
        );
        info!("Hub: started agent {}:{}", user_id, site_id);
        Ok(agent)
    }

    /// Start every agent that has persisted state. Returns how many started.
    pub async fn restore_all(&self) -> Result<usize> {
        let keys = self.deps.store.list(store::AGENT_PREFIX).await?;
        info!("Hub: restoring {} persisted agent(s)", keys.len());

        let mut started = 0;
        for key in keys {
            let Some((user_id, site_id)) = store::parse_agent_key(&key) else {
                warn!("Hub: skipping malformed agent key '{}'", key);
                continue;
            };
            if self.sites.get(site_id).is_none() {
                warn!("Hub: no adapter for site '{}', skipping {}", site_id, key);
                continue;
            }
            match self.get_or_spawn(user_id, site_id).await {
                Ok(_) => started += 1,
                Err(e) => error!("Hub: could not restore {}: {:#}", key, e),
            }
        }
        Ok(started)
    }

    /// All running agents, sorted by (user, site).
    pub async fn agents(&self) -> Vec<Arc<Agent>> {
        let agents = self.agents.read().await;
        let mut keys: Vec<&(String, String)> = agents.keys().collect();
        keys.sort();
        keys.into_iter().map(|k| agents[k].agent.clone()).collect()
    }

    /// Stop every driver task.
    pub async fn shutdown(&self) {
        let mut agents = self.agents.write().await;
        for ((user_id, site_id), handle) in agents.drain() {
            handle.task.abort();
            info!("Hub: stopped agent {}:{}", user_id, site_id);
        }
    }
}
