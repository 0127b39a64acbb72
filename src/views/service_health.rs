//! Health of a single service's instances, maintained from register and
//! deregister events.

use crate::cache::{Request, RequestInfo};
use crate::stream::{SubscribeRequest, View, ViewFactory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const SERVICE_HEALTH_TOPIC: &str = "service-health";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub node: String,
    pub service_id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub passing: bool,
}

impl ServiceNode {
    fn key(&self) -> (String, String) {
        (self.node.clone(), self.service_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HealthEvent {
    Register(ServiceNode),
    Deregister { node: String, service_id: String },
}

/// View result: every known instance, ordered by node then service id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNodes {
    pub index: u64,
    pub nodes: Vec<ServiceNode>,
}

#[derive(Debug)]
pub struct ServiceHealthView {
    service: String,
    passing_only: bool,
    nodes: BTreeMap<(String, String), ServiceNode>,
}

impl ServiceHealthView {
    pub fn new(service: impl Into<String>, passing_only: bool) -> Self {
        Self {
            service: service.into(),
            passing_only,
            nodes: BTreeMap::new(),
        }
    }
}

impl View for ServiceHealthView {
    type Event = HealthEvent;
    type Value = ServiceNodes;

    fn update(&mut self, events: Vec<HealthEvent>) -> anyhow::Result<()> {
        for event in events {
            match event {
                HealthEvent::Register(node) => {
                    if node.service != self.service {
                        anyhow::bail!(
                            "event for service {:?} delivered to view of {:?}",
                            node.service,
                            self.service
                        );
                    }
                    if self.passing_only && !node.passing {
                        self.nodes.remove(&node.key());
                    } else {
                        self.nodes.insert(node.key(), node);
                    }
                }
                HealthEvent::Deregister { node, service_id } => {
                    self.nodes.remove(&(node, service_id));
                }
            }
        }
        Ok(())
    }

    fn result(&self, index: u64) -> anyhow::Result<ServiceNodes> {
        Ok(ServiceNodes {
            index,
            nodes: self.nodes.values().cloned().collect(),
        })
    }

    fn reset(&mut self) {
        self.nodes.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceHealthRequest {
    pub service: String,
    pub datacenter: String,
    pub token: String,
    pub passing_only: bool,
    pub min_index: u64,
    pub timeout: Duration,
}

impl Request for ServiceHealthRequest {
    fn cache_info(&self) -> RequestInfo {
        let filter = if self.passing_only { "passing" } else { "all" };
        RequestInfo {
            key: format!("{}/{filter}", self.service),
            token: self.token.clone(),
            datacenter: self.datacenter.clone(),
            min_index: self.min_index,
            timeout: self.timeout,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceHealthFactory;

impl ViewFactory for ServiceHealthFactory {
    type Request = ServiceHealthRequest;
    type View = ServiceHealthView;

    fn new_view(&self, req: &ServiceHealthRequest) -> anyhow::Result<ServiceHealthView> {
        if req.service.is_empty() {
            anyhow::bail!("service health requests need a service name");
        }
        Ok(ServiceHealthView::new(&req.service, req.passing_only))
    }

    fn subscribe_request(&self, req: &ServiceHealthRequest, index: u64) -> SubscribeRequest {
        SubscribeRequest {
            topic: SERVICE_HEALTH_TOPIC.to_string(),
            key: req.service.clone(),
            token: req.token.clone(),
            datacenter: req.datacenter.clone(),
            index,
        }
    }
}
