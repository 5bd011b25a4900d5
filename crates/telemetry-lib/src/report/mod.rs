//! Report building
//!
//! Statistics readers for the host and for each VM, and the definition
//! table turning them into a metrics document.

pub mod definitions;
mod domain;
mod host;

pub use definitions::{
    build_document, describe, host_metrics, vm_metrics, MetricDefinition, METRICS,
};
pub use domain::{DomainStatsSource, ProcDomainStats};
pub use host::{HostStatsReader, USER_HZ};
