//! Synthetic workload: service registrations are streamed into the cache and
//! several watchers per service follow them through `notify`.

use crate::cache::{Cache, RegisterOptions, UpdateEvent};
use crate::config::Config;
use crate::stream::{QueueStreamClient, StreamEvent, StreamingType};
use crate::utils::fmt_duration;
use crate::views::{
    HealthEvent, ServiceHealthFactory, ServiceHealthRequest, ServiceNode, ServiceNodes,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DATACENTER: &str = "dc1";
const NODES_PER_SERVICE: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemoSummary {
    pub updates: u64,
    pub watchers_done: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoParams {
    pub watchers: usize,
    pub events: u64,
}

impl DemoParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            watchers: config.demo.watchers,
            events: config.demo.events,
        }
    }
}

fn instance(service: &str, n: u64, passing: bool) -> ServiceNode {
    ServiceNode {
        node: format!("node{n}"),
        service_id: format!("{service}-{n}"),
        service: service.to_string(),
        address: format!("10.0.{}.{n}", service.len()),
        port: 8080,
        passing,
    }
}

/// Runs until every watcher has seen the final index of its service, or
/// until `shutdown` fires.
pub async fn run(
    config: &Config,
    params: DemoParams,
    shutdown: CancellationToken,
) -> anyhow::Result<DemoSummary> {
    let services = config.demo.services.clone();
    if services.is_empty() || params.watchers == 0 {
        anyhow::bail!("demo needs at least one service and one watcher");
    }

    let client = QueueStreamClient::<HealthEvent>::new();
    let cache = Cache::new(config.cache_options());
    let health = cache.register_type(
        "service-health",
        StreamingType::new(ServiceHealthFactory, Arc::new(client.clone())),
        RegisterOptions {
            last_get_ttl: config.default_last_get_ttl,
            ..StreamingType::<ServiceHealthFactory>::register_options()
        },
    );

    for service in &services {
        client.queue_events(
            service,
            [
                StreamEvent::update(1, HealthEvent::Register(instance(service, 1, true))),
                StreamEvent::end_of_snapshot(1),
            ],
        );
    }

    let watches = shutdown.child_token();
    let (tx, mut rx) = mpsc::channel::<UpdateEvent<ServiceNodes>>(64);
    let mut targets: HashMap<String, u64> = HashMap::new();
    for service in &services {
        for n in 0..params.watchers {
            let id = format!("{service}/{n}");
            let req = ServiceHealthRequest {
                service: service.clone(),
                datacenter: DATACENTER.to_string(),
                ..Default::default()
            };
            cache.notify(watches.clone(), &health, req, id.clone(), tx.clone())?;
            targets.insert(id, params.events + 1);
        }
    }
    drop(tx);
    info!(
        services = services.len(),
        watchers = targets.len(),
        events = params.events,
        "demo watchers started"
    );

    let publisher = {
        let client = client.clone();
        let services = services.clone();
        let interval = config.demo.event_interval;
        let stop = shutdown.clone();
        tokio::spawn(async move {
            for i in 1..=params.events {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = stop.cancelled() => return,
                }
                let index = i + 1;
                for service in &services {
                    let n = 1 + i % NODES_PER_SERVICE;
                    let event = if i % 7 == 0 {
                        HealthEvent::Deregister {
                            node: format!("node{n}"),
                            service_id: format!("{service}-{n}"),
                        }
                    } else {
                        HealthEvent::Register(instance(service, n, i % 3 != 0))
                    };
                    client.queue_events(service, [StreamEvent::update(index, event)]);
                }
                debug!(index, "published events");
            }
        })
    };

    let started = Instant::now();
    let mut summary = DemoSummary::default();
    while !targets.is_empty() {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.cancelled() => {
                summary.interrupted = true;
                break;
            }
        };
        let Some(event) = event else {
            warn!("all watchers stopped early");
            break;
        };
        if let Some(err) = &event.err {
            warn!(correlation_id = %event.correlation_id, error = %err, "watch reported an error");
            continue;
        }

        summary.updates += 1;
        let nodes = event.result.map(|r| r.nodes.len()).unwrap_or_default();
        info!(
            correlation_id = %event.correlation_id,
            index = event.meta.index,
            nodes,
            "service health changed"
        );
        if targets
            .get(&event.correlation_id)
            .is_some_and(|target| event.meta.index >= *target)
        {
            targets.remove(&event.correlation_id);
            summary.watchers_done += 1;
        }
    }

    publisher.abort();
    watches.cancel();
    let stats = cache.stats();
    info!(
        updates = summary.updates,
        watchers_done = summary.watchers_done,
        hits = stats.hits,
        misses = stats.misses(),
        fetches = stats.fetch_success,
        entries = stats.entries,
        subscriptions = client.requests().len(),
        duration = fmt_duration(started.elapsed()),
        "demo finished"
    );
    cache.close();
    Ok(summary)
}
