//! Core data models for the telemetry agent

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where a metric was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricContext {
    /// Measured on the hypervisor host
    Host,
    /// Measured for the guest; serialized as `vm`
    #[serde(rename = "vm")]
    Guest,
}

impl MetricContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricContext::Host => "host",
            MetricContext::Guest => "vm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "host" => Some(MetricContext::Host),
            "vm" => Some(MetricContext::Guest),
            _ => None,
        }
    }
}

impl fmt::Display for MetricContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire type of a metric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Real64,
    Real32,
    Int64,
    Int32,
    UInt64,
    UInt32,
    String,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Real64 => "real64",
            MetricType::Real32 => "real32",
            MetricType::Int64 => "int64",
            MetricType::Int32 => "int32",
            MetricType::UInt64 => "uint64",
            MetricType::UInt32 => "uint32",
            MetricType::String => "string",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "real64" => Some(MetricType::Real64),
            "real32" => Some(MetricType::Real32),
            "int64" => Some(MetricType::Int64),
            "int32" => Some(MetricType::Int32),
            "uint64" => Some(MetricType::UInt64),
            "uint32" => Some(MetricType::UInt32),
            "string" => Some(MetricType::String),
            _ => None,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed source value; its variant decides the metric type
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Real64(f64),
    Real32(f32),
    Int64(i64),
    Int32(i32),
    UInt64(u64),
    UInt32(u32),
    String(String),
}

impl MetricValue {
    pub fn metric_type(&self) -> MetricType {
        match self {
            MetricValue::Real64(_) => MetricType::Real64,
            MetricValue::Real32(_) => MetricType::Real32,
            MetricValue::Int64(_) => MetricType::Int64,
            MetricValue::Int32(_) => MetricType::Int32,
            MetricValue::UInt64(_) => MetricType::UInt64,
            MetricValue::UInt32(_) => MetricType::UInt32,
            MetricValue::String(_) => MetricType::String,
        }
    }

    /// Render the value the way readers expect it (floats with 6 decimals)
    pub fn render(&self) -> String {
        match self {
            MetricValue::Real64(v) => format!("{:.6}", v),
            MetricValue::Real32(v) => format!("{:.6}", v),
            MetricValue::Int64(v) => v.to_string(),
            MetricValue::Int32(v) => v.to_string(),
            MetricValue::UInt64(v) => v.to_string(),
            MetricValue::UInt32(v) => v.to_string(),
            MetricValue::String(v) => v.clone(),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Real64(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Real32(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int64(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Int32(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::UInt64(v)
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::UInt32(v)
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::String(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::String(v.to_string())
    }
}

/// A single metric entry of a metrics document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub context: MetricContext,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Metric {
    /// Build a metric, deriving its type from the value
    pub fn new(
        name: impl Into<String>,
        context: MetricContext,
        value: impl Into<MetricValue>,
        unit: Option<&str>,
    ) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            context,
            metric_type: value.metric_type(),
            value: value.render(),
            unit: unit.map(str::to_string),
        }
    }

    /// Rebuild a metric from already rendered parts (used when decoding)
    pub fn from_parts(
        name: String,
        context: MetricContext,
        metric_type: MetricType,
        value: String,
        unit: Option<String>,
    ) -> Self {
        Self {
            name,
            context,
            metric_type,
            value,
            unit,
        }
    }
}

/// Ordered collection of metrics handed to guests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsDocument {
    pub metrics: Vec<Metric>,
}

impl MetricsDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter()
    }

    /// Look up the first metric with a name in a context
    pub fn find(&self, name: &str, context: MetricContext) -> Option<&Metric> {
        self.metrics
            .iter()
            .find(|m| m.name == name && m.context == context)
    }
}

impl Extend<Metric> for MetricsDocument {
    fn extend<I: IntoIterator<Item = Metric>>(&mut self, iter: I) {
        self.metrics.extend(iter);
    }
}

impl FromIterator<Metric> for MetricsDocument {
    fn from_iter<I: IntoIterator<Item = Metric>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().collect(),
        }
    }
}

/// Guest delivery mechanisms a VM asked for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestMetricsConfig {
    /// Exchange disk file exposed to the guest as a block device
    #[serde(default)]
    pub disk: Option<PathBuf>,
    /// Hypervisor-created unix socket backing the guest's serial channel
    #[serde(default)]
    pub channel: Option<PathBuf>,
}

/// A VM session tracked by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub namespace: String,
    /// PID of the hypervisor process running the guest
    pub pid: u32,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    /// Memory assigned to the guest
    #[serde(default)]
    pub memory_kib: u64,
    #[serde(default)]
    pub guest_metrics: GuestMetricsConfig,
}

fn default_vcpus() -> u32 {
    1
}

impl VmInfo {
    /// Registry key (`namespace/name`)
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Raw host statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostStats {
    pub hostname: String,
    pub cpu_count: u32,
    pub total_cpu_time_secs: f64,
    pub mem_total_kib: u64,
    pub mem_free_kib: u64,
    pub mem_available_kib: u64,
    pub swap_total_kib: u64,
    pub swap_free_kib: u64,
    pub paged_in_kib: u64,
    pub paged_out_kib: u64,
    pub timestamp: i64,
}

/// Raw statistics of one VM process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainStats {
    pub cpu_time_secs: f64,
    pub resident_kib: u64,
    pub vcpus: u32,
    pub memory_limit_kib: u64,
}
