//! Static table of the metrics published to guests

use crate::models::{
    DomainStats, HostStats, Metric, MetricContext, MetricValue, MetricsDocument, VmInfo,
};

/// Shape of one published metric
#[derive(Debug, Clone, Copy)]
pub struct MetricDefinition {
    pub name: &'static str,
    pub context: MetricContext,
    pub unit: Option<&'static str>,
    pub help: &'static str,
}

impl MetricDefinition {
    pub fn metric(&self, value: impl Into<MetricValue>) -> Metric {
        Metric::new(self.name, self.context, value, self.unit)
    }
}

const fn host(
    name: &'static str,
    unit: Option<&'static str>,
    help: &'static str,
) -> MetricDefinition {
    MetricDefinition {
        name,
        context: MetricContext::Host,
        unit,
        help,
    }
}

const fn guest(
    name: &'static str,
    unit: Option<&'static str>,
    help: &'static str,
) -> MetricDefinition {
    MetricDefinition {
        name,
        context: MetricContext::Guest,
        unit,
        help,
    }
}

pub const HOST_NAME: MetricDefinition = host("HostName", None, "Host name of the node");
pub const HOST_SYSTEM_INFO: MetricDefinition =
    host("HostSystemInfo", None, "Operating system of the node");
pub const VIRTUALIZATION_VENDOR: MetricDefinition =
    host("VirtualizationVendor", None, "Vendor of the virtualization stack");
pub const VIRT_PRODUCT_INFO: MetricDefinition =
    host("VirtProductInfo", None, "Version of the telemetry agent");
pub const NUMBER_OF_PHYSICAL_CPUS: MetricDefinition =
    host("NumberOfPhysicalCPUs", None, "Number of logical CPUs on the node");
pub const HOST_TOTAL_CPU_TIME: MetricDefinition =
    host("TotalCPUTime", Some("s"), "CPU time spent by the node since boot");
pub const FREE_PHYSICAL_MEMORY: MetricDefinition =
    host("FreePhysicalMemory", Some("KiB"), "Unused physical memory");
pub const FREE_VIRTUAL_MEMORY: MetricDefinition =
    host("FreeVirtualMemory", Some("KiB"), "Unused physical memory plus free swap");
pub const MEMORY_ALLOCATED_TO_VIRTUAL_SERVERS: MetricDefinition = host(
    "MemoryAllocatedToVirtualServers",
    Some("KiB"),
    "Physical memory not available to new allocations",
);
pub const USED_VIRTUAL_MEMORY: MetricDefinition =
    host("UsedVirtualMemory", Some("KiB"), "Used physical memory plus used swap");
pub const PAGED_IN_MEMORY: MetricDefinition =
    host("PagedInMemory", Some("KiB"), "Memory paged in since boot");
pub const PAGED_OUT_MEMORY: MetricDefinition =
    host("PagedOutMemory", Some("KiB"), "Memory paged out since boot");
pub const TIME: MetricDefinition = host("Time", Some("s"), "Unix time of the sample");

pub const VM_TOTAL_CPU_TIME: MetricDefinition =
    guest("TotalCPUTime", Some("s"), "CPU time consumed by the VM process");
pub const RESOURCE_PROCESSOR_LIMIT: MetricDefinition =
    guest("ResourceProcessorLimit", None, "Number of vCPUs assigned to the VM");
pub const PHYSICAL_MEMORY_ALLOCATED_TO_VIRTUAL_SYSTEM: MetricDefinition = guest(
    "PhysicalMemoryAllocatedToVirtualSystem",
    Some("KiB"),
    "Resident memory of the VM process",
);
pub const RESOURCE_MEMORY_LIMIT: MetricDefinition =
    guest("ResourceMemoryLimit", Some("KiB"), "Memory assigned to the VM");

/// Every metric a full report carries, in publication order
pub static METRICS: &[MetricDefinition] = &[
    HOST_NAME,
    HOST_SYSTEM_INFO,
    VIRTUALIZATION_VENDOR,
    VIRT_PRODUCT_INFO,
    NUMBER_OF_PHYSICAL_CPUS,
    HOST_TOTAL_CPU_TIME,
    FREE_PHYSICAL_MEMORY,
    FREE_VIRTUAL_MEMORY,
    MEMORY_ALLOCATED_TO_VIRTUAL_SERVERS,
    USED_VIRTUAL_MEMORY,
    PAGED_IN_MEMORY,
    PAGED_OUT_MEMORY,
    TIME,
    VM_TOTAL_CPU_TIME,
    RESOURCE_PROCESSOR_LIMIT,
    PHYSICAL_MEMORY_ALLOCATED_TO_VIRTUAL_SYSTEM,
    RESOURCE_MEMORY_LIMIT,
];

const VENDOR: &str = "vm-telemetry";

/// Help text of a published metric
pub fn describe(name: &str, context: MetricContext) -> Option<&'static str> {
    METRICS
        .iter()
        .find(|d| d.name == name && d.context == context)
        .map(|d| d.help)
}

/// Host section of a report
pub fn host_metrics(stats: &HostStats) -> Vec<Metric> {
    let free_virtual = stats.mem_free_kib + stats.swap_free_kib;
    let total_virtual = stats.mem_total_kib + stats.swap_total_kib;

    vec![
        HOST_NAME.metric(stats.hostname.as_str()),
        HOST_SYSTEM_INFO.metric(std::env::consts::OS),
        VIRTUALIZATION_VENDOR.metric(VENDOR),
        VIRT_PRODUCT_INFO.metric(env!("CARGO_PKG_VERSION")),
        NUMBER_OF_PHYSICAL_CPUS.metric(i64::from(stats.cpu_count)),
        HOST_TOTAL_CPU_TIME.metric(stats.total_cpu_time_secs),
        FREE_PHYSICAL_MEMORY.metric(stats.mem_free_kib),
        FREE_VIRTUAL_MEMORY.metric(free_virtual),
        MEMORY_ALLOCATED_TO_VIRTUAL_SERVERS
            .metric(stats.mem_total_kib.saturating_sub(stats.mem_available_kib)),
        USED_VIRTUAL_MEMORY.metric(total_virtual.saturating_sub(free_virtual)),
        PAGED_IN_MEMORY.metric(stats.paged_in_kib),
        PAGED_OUT_MEMORY.metric(stats.paged_out_kib),
        TIME.metric(stats.timestamp.max(0) as u64),
    ]
}

/// Guest section of a report
pub fn vm_metrics(vm: &VmInfo, stats: &DomainStats) -> Vec<Metric> {
    let vcpus = if stats.vcpus > 0 { stats.vcpus } else { vm.vcpus };
    let memory_limit = if stats.memory_limit_kib > 0 {
        stats.memory_limit_kib
    } else {
        vm.memory_kib
    };

    vec![
        VM_TOTAL_CPU_TIME.metric(stats.cpu_time_secs),
        RESOURCE_PROCESSOR_LIMIT.metric(vcpus),
        PHYSICAL_MEMORY_ALLOCATED_TO_VIRTUAL_SYSTEM.metric(stats.resident_kib),
        RESOURCE_MEMORY_LIMIT.metric(memory_limit),
    ]
}

/// Full document: host metrics followed by the VM's own metrics
pub fn build_document(host: &HostStats, vm: &VmInfo, stats: &DomainStats) -> MetricsDocument {
    let mut doc = MetricsDocument::new();
    doc.extend(host_metrics(host));
    doc.extend(vm_metrics(vm, stats));
    doc
}
