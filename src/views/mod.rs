//! Concrete views served through [`StreamingType`](crate::stream::StreamingType).

pub mod service_health;

pub use service_health::{
    HealthEvent, ServiceHealthFactory, ServiceHealthRequest, ServiceHealthView, ServiceNode,
    ServiceNodes,
};
