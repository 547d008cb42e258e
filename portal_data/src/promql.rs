//! PromQL templates for every graph.
//!
//! All metric names are the ones exported by slurm-job-exporter (`slurm_job_*`), the
//! recording rules summing those per user and account (`slurm_job:*:*_user_account`),
//! the slurm exporter (`slurm_account_levelfs`) and the lustre job stats exporter.

use std::fmt::{self, Display};

use derive_more::derive::{Deref, Display as DisplayDerive, From};
use itertools::Itertools as _;
use serde::Deserialize;

use crate::account::{SlurmAccount, SlurmUser};

/// Label matchers appended to every selector to scope queries to this cluster, e.g.
/// `cluster="narval"`. May be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, DisplayDerive, From, Deserialize)]
pub struct EnvFilter(pub String);

impl From<&str> for EnvFilter {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

const GIB: &str = "(1024*1024*1024)";
const MIB: &str = "(1024*1024)";

fn escape(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', "\\\"")
}

/// Backslash every RE2 metacharacter so `value` only matches itself inside `=~`.
fn regex_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if r"\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `{label="value",other=~"regex", <env filter>}`
#[derive(Debug, Clone)]
pub struct Selector<'a> {
    matchers: Vec<String>,
    filter: &'a EnvFilter,
}

impl<'a> Selector<'a> {
    pub fn new(filter: &'a EnvFilter) -> Self {
        Self {
            matchers: Vec::new(),
            filter,
        }
    }

    pub fn eq(mut self, label: &str, value: &str) -> Self {
        self.matchers.push(format!(r#"{label}="{}""#, escape(value)));
        self
    }

    pub fn re(mut self, label: &str, value: &str) -> Self {
        self.matchers.push(format!(r#"{label}=~"{}""#, escape(value)));
        self
    }

    /// Exporters on any port of the given hosts, `instance=~"(a|b)(:[0-9]+)?"`.
    pub fn hosts(self, hosts: &[String]) -> Self {
        let hosts = hosts.iter().map(|host| regex_literal(host)).join("|");
        self.re("instance", &format!("({hosts})(:[0-9]+)?"))
    }
}

impl Display for Selector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}", self.matchers.join(","))?;
        if !self.filter.trim().is_empty() {
            if !self.matchers.is_empty() {
                f.write_str(", ")?;
            }
            f.write_str(self.filter.trim())?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Cpu,
    Memory,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Allocated,
    Used,
    /// allocated − used
    Wasted,
}

impl Resource {
    fn allocated_metric(self) -> &'static str {
        match self {
            Resource::Cpu => "slurm_job:allocated_core:count_user_account",
            Resource::Memory => "slurm_job:allocated_memory:sum_user_account",
            Resource::Gpu => "slurm_job:allocated_gpu:count_user_account",
        }
    }

    fn used_metric(self) -> &'static str {
        match self {
            Resource::Cpu => "slurm_job:used_core:sum_user_account",
            Resource::Memory => "slurm_job:rss_memory:sum_user_account",
            Resource::Gpu => "slurm_job:used_gpu:sum_user_account",
        }
    }

    /// GPU waste is left unclamped: idle allocated GPUs can be reported as slightly
    /// negative and users asked to see that.
    fn clamps_waste(self) -> bool {
        !matches!(self, Resource::Gpu)
    }

    fn divisor(self) -> Option<&'static str> {
        match self {
            Resource::Memory => Some(GIB),
            _ => None,
        }
    }
}

/// Per-user allocated/used/wasted cores, memory (GiB) or GPUs of an account.
pub fn account_usage(resource: Resource, usage: Usage, account: &SlurmAccount, filter: &EnvFilter) -> String {
    let sel = Selector::new(filter).eq("account", account);
    let alloc = format!("sum({}{sel}) by (user)", resource.allocated_metric());
    let used = format!("sum({}{sel}) by (user)", resource.used_metric());
    let expr = match usage {
        Usage::Allocated => alloc,
        Usage::Used => used,
        Usage::Wasted if resource.clamps_waste() => format!("clamp_min({alloc} - {used}, 0)"),
        Usage::Wasted => format!("{alloc} - {used}"),
    };
    match resource.divisor() {
        Some(divisor) => format!("{expr} /{divisor}"),
        None => expr,
    }
}

/// Per-user GPU power of an account in W. "Allocated" is the number of GPUs reporting power
/// times the per-GPU budget.
pub fn account_gpu_power(usage: Usage, account: &SlurmAccount, filter: &EnvFilter, watts_per_gpu: u32) -> String {
    let sel = Selector::new(filter).eq("account", account);
    let alloc = format!("count(slurm_job_power_gpu{sel}) by (user) * {watts_per_gpu}");
    let used = format!("sum(slurm_job_power_gpu{sel}) by (user) / 1000");
    match usage {
        Usage::Allocated => alloc,
        Usage::Used => used,
        Usage::Wasted => format!("({alloc}) - ({used})"),
    }
}

/// Whose filesystem traffic a lustre query covers.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Every user of an account, grouped by (user, fs).
    Account(&'a SlurmAccount),
    /// One user, grouped by fs.
    User(&'a SlurmUser),
    /// One job, grouped by fs.
    Job(u32),
}

impl Scope<'_> {
    fn label(&self) -> (&'static str, String) {
        match self {
            Scope::Account(account) => ("account", account.to_string()),
            Scope::User(user) => ("user", user.to_string()),
            Scope::Job(job_id) => ("jobid", job_id.to_string()),
        }
    }

    fn grouping(&self) -> &'static str {
        match self {
            Scope::Account(_) => "user, fs",
            Scope::User(_) | Scope::Job(_) => "fs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DisplayDerive)]
pub enum IoDirection {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
}

/// Metadata operations per second, series that are constantly 0 dropped.
pub fn lustre_mdt(scope: Scope<'_>, filter: &EnvFilter) -> String {
    let (label, value) = scope.label();
    let sel = Selector::new(filter).re("component", "mdt").eq(label, &value);
    format!("sum(rate(lustre_job_stats_total{sel}[5m])) by ({}) !=0", scope.grouping())
}

/// OST throughput in MiB/s.
pub fn lustre_ost(direction: IoDirection, scope: Scope<'_>, filter: &EnvFilter) -> String {
    let (label, value) = scope.label();
    let sel = Selector::new(filter)
        .re("component", "ost")
        .eq(label, &value)
        .re("target", ".*-OST.*");
    format!(
        "(sum(rate(lustre_job_{direction}_bytes_total{sel}[5m])) by ({})) / {MIB}",
        scope.grouping()
    )
}

/// Which allocation family a priority graph is drawn for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityKind {
    Cpu,
    Gpu,
}

impl PriorityKind {
    fn resource(self) -> Resource {
        match self {
            PriorityKind::Cpu => Resource::Cpu,
            PriorityKind::Gpu => Resource::Gpu,
        }
    }
}

/// Account total, `vector(0)` when nothing ran so there always is a series.
pub fn priority_allocated(kind: PriorityKind, account: &SlurmAccount, filter: &EnvFilter) -> String {
    let sel = Selector::new(filter).eq("account", account);
    format!("sum({}{sel}) or vector(0)", kind.resource().allocated_metric())
}

pub fn priority_used(kind: PriorityKind, account: &SlurmAccount, filter: &EnvFilter) -> String {
    let sel = Selector::new(filter).eq("account", account);
    format!("sum({}{sel}) or vector(0)", kind.resource().used_metric())
}

/// Slurm level fairshare of the account.
pub fn levelfs(account: &SlurmAccount, filter: &EnvFilter) -> String {
    let sel = Selector::new(filter).eq("account", account);
    format!("slurm_account_levelfs{sel}")
}

/// Per-job usage of one user, grouped by `slurmjobid`.
pub mod user {
    use super::*;

    pub fn cpu(user: &SlurmUser, filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).eq("user", user);
        format!("sum(rate(slurm_job_core_usage_total{sel}[2m]) / 1000000000) by (slurmjobid)")
    }

    pub fn memory(user: &SlurmUser, filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).eq("user", user);
        format!("sum(slurm_job_memory_usage{sel}) by (slurmjobid) /{GIB}")
    }

    pub fn gpu_utilization(user: &SlurmUser, filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).eq("user", user);
        format!("sum(slurm_job_utilization_gpu{sel}) by (slurmjobid)")
    }

    pub fn gpu_power(user: &SlurmUser, filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).eq("user", user);
        format!("sum(slurm_job_power_gpu{sel}) by (slurmjobid) / 1000")
    }
}

/// Usage of a single job. Each GPU is its own series (`gpu` label).
pub mod job {
    use super::*;

    fn selector(job_id: u32, filter: &EnvFilter) -> Selector<'_> {
        Selector::new(filter).eq("slurmjobid", &job_id.to_string())
    }

    pub fn cpu(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(rate(slurm_job_core_usage_total{sel}[2m]) / 1000000000)")
    }

    pub fn memory_used(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(slurm_job_memory_usage{sel}) /{GIB}")
    }

    pub fn memory_allocated(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(slurm_job_memory_limit{sel}) /{GIB}")
    }

    pub fn gpu_utilization(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(slurm_job_utilization_gpu{sel}) by (gpu)")
    }

    pub fn gpu_memory(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(slurm_job_memory_usage_gpu{sel}) by (gpu) /{GIB}")
    }

    pub fn gpu_power(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(slurm_job_power_gpu{sel}) by (gpu) / 1000")
    }

    pub fn gpu_memory_utilization(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(slurm_job_memory_utilization_gpu{sel}) by (gpu)")
    }

    /// MiB/s per GPU and `direction` (TX/RX).
    pub fn gpu_pcie(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(slurm_job_pcie_gpu{sel}) by (gpu, direction) /{MIB}")
    }

    /// MiB/s per GPU and `direction` (TX/RX).
    pub fn gpu_nvlink(job_id: u32, filter: &EnvFilter) -> String {
        let sel = selector(job_id, filter);
        format!("sum(slurm_job_nvlink_gpu{sel}) by (gpu, direction) /{MIB}")
    }
}

/// Node-level metrics of the hosts a job ran on, one series per `instance`. Other jobs
/// sharing those nodes are included.
pub mod node {
    use super::*;

    /// Scratch space local to each compute node.
    pub const LOCAL_SCRATCH: &str = "/localscratch";

    /// Infiniband traffic in MiB/s, `Read` is received.
    pub fn infiniband(direction: IoDirection, nodes: &[String], filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).hosts(nodes);
        let metric = match direction {
            IoDirection::Read => "node_infiniband_port_data_received_bytes_total",
            IoDirection::Write => "node_infiniband_port_data_transmitted_bytes_total",
        };
        format!("sum(rate({metric}{sel}[5m])) by (instance) /{MIB}")
    }

    pub fn disk_iops(direction: IoDirection, nodes: &[String], filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).hosts(nodes);
        let metric = match direction {
            IoDirection::Read => "node_disk_reads_completed_total",
            IoDirection::Write => "node_disk_writes_completed_total",
        };
        format!("sum(rate({metric}{sel}[5m])) by (instance)")
    }

    /// MiB/s.
    pub fn disk_bandwidth(direction: IoDirection, nodes: &[String], filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).hosts(nodes);
        let metric = match direction {
            IoDirection::Read => "node_disk_read_bytes_total",
            IoDirection::Write => "node_disk_written_bytes_total",
        };
        format!("sum(rate({metric}{sel}[5m])) by (instance) /{MIB}")
    }

    /// GiB used on [`LOCAL_SCRATCH`].
    pub fn disk_used(nodes: &[String], filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).hosts(nodes).eq("mountpoint", LOCAL_SCRATCH);
        format!("sum(node_filesystem_size_bytes{sel} - node_filesystem_avail_bytes{sel}) by (instance) /{GIB}")
    }

    /// Whole-node power draw in W as reported by the BMC.
    pub fn power(nodes: &[String], filter: &EnvFilter) -> String {
        let sel = Selector::new(filter).hosts(nodes);
        format!("sum(ipmi_dcmi_power_consumption_watts{sel}) by (instance)")
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> EnvFilter {
        EnvFilter::from(r#"cluster="narval""#)
    }

    #[test]
    fn Selector__display() {
        let filter = filter();
        assert_eq!(Selector::new(&filter).eq("account", "def-alice").to_string(), r#"{account="def-alice", cluster="narval"}"#);
        assert_eq!(Selector::new(&filter).to_string(), r#"{cluster="narval"}"#);

        let empty = EnvFilter::default();
        assert_eq!(Selector::new(&empty).eq("a", "b").re("c", "d.*").to_string(), r#"{a="b",c=~"d.*"}"#);
    }

    #[test]
    fn Selector__escapes_quotes() {
        let empty = EnvFilter::default();
        let sel = Selector::new(&empty).eq("account", r#"x"} or vector(1) or {a=""#).to_string();
        assert_eq!(sel, r#"{account="x\"} or vector(1) or {a=\""}"#);
    }

    #[test]
    fn account_usage__cpu_allocated() {
        let query = account_usage(Resource::Cpu, Usage::Allocated, &"def-alice".into(), &filter());
        assert_eq!(
            query,
            r#"sum(slurm_job:allocated_core:count_user_account{account="def-alice", cluster="narval"}) by (user)"#
        );
    }

    #[test]
    fn account_usage__wasted_cpu_and_memory_are_clamped() {
        let cpu = account_usage(Resource::Cpu, Usage::Wasted, &"def-alice".into(), &filter());
        assert!(cpu.starts_with("clamp_min(sum(slurm_job:allocated_core:count_user_account"));
        assert!(cpu.ends_with("by (user), 0)"));

        let mem = account_usage(Resource::Memory, Usage::Wasted, &"def-alice".into(), &filter());
        assert!(mem.starts_with("clamp_min(sum(slurm_job:allocated_memory:sum_user_account"));
        assert!(mem.contains("- sum(slurm_job:rss_memory:sum_user_account"));
        assert!(mem.ends_with(", 0) /(1024*1024*1024)"));

        let gpu = account_usage(Resource::Gpu, Usage::Wasted, &"def-alice".into(), &filter());
        assert!(!gpu.contains("clamp_min"));
    }

    #[test]
    fn account_gpu_power__budget_per_gpu() {
        let query = account_gpu_power(Usage::Allocated, &"rrg-bob".into(), &filter(), 250);
        assert_eq!(query, r#"count(slurm_job_power_gpu{account="rrg-bob", cluster="narval"}) by (user) * 250"#);
        let wasted = account_gpu_power(Usage::Wasted, &"rrg-bob".into(), &filter(), 300);
        assert!(wasted.starts_with("(count(") && wasted.ends_with("/ 1000)"));
    }

    #[test]
    fn lustre__scopes() {
        let account = SlurmAccount::from("def-alice");
        let mdt = lustre_mdt(Scope::Account(&account), &filter());
        assert_eq!(
            mdt,
            r#"sum(rate(lustre_job_stats_total{component=~"mdt",account="def-alice", cluster="narval"}[5m])) by (user, fs) !=0"#
        );

        let user = SlurmUser::from("alice");
        let ost = lustre_ost(IoDirection::Write, Scope::User(&user), &filter());
        assert_eq!(
            ost,
            r#"(sum(rate(lustre_job_write_bytes_total{component=~"ost",user="alice",target=~".*-OST.*", cluster="narval"}[5m])) by (fs)) / (1024*1024)"#
        );

        let job = lustre_mdt(Scope::Job(4242), &filter());
        assert!(job.contains(r#"jobid="4242""#));
        assert!(job.ends_with("by (fs) !=0"));
    }

    #[test]
    fn lustre__account_name_is_not_a_pattern() {
        let account = SlurmAccount::from("def-a.ice");
        let mdt = lustre_mdt(Scope::Account(&account), &EnvFilter::default());
        assert!(mdt.contains(r#"account="def-a.ice""#));
        assert!(!mdt.contains("account=~"));
    }

    #[test]
    fn Selector__hosts__escapes_regex() {
        let empty = EnvFilter::default();
        let hosts = ["nc10001".to_owned(), "gpu1.narval".to_owned()];
        assert_eq!(
            Selector::new(&empty).hosts(&hosts).to_string(),
            r#"{instance=~"(nc10001|gpu1\\.narval)(:[0-9]+)?"}"#
        );
    }

    #[test]
    fn node__queries() {
        let nodes = ["nc10001".to_owned()];
        assert_eq!(
            node::infiniband(IoDirection::Write, &nodes, &filter()),
            r#"sum(rate(node_infiniband_port_data_transmitted_bytes_total{instance=~"(nc10001)(:[0-9]+)?", cluster="narval"}[5m])) by (instance) /(1024*1024)"#
        );
        let used = node::disk_used(&nodes, &filter());
        assert_eq!(used.matches(r#"mountpoint="/localscratch""#).count(), 2);
        assert!(node::power(&nodes, &filter()).starts_with("sum(ipmi_dcmi_power_consumption_watts{"));
    }

    #[test]
    fn priority__queries() {
        let account = SlurmAccount::from("rrg-alice");
        assert_eq!(
            priority_allocated(PriorityKind::Gpu, &account, &filter()),
            r#"sum(slurm_job:allocated_gpu:count_user_account{account="rrg-alice", cluster="narval"}) or vector(0)"#
        );
        assert!(priority_used(PriorityKind::Cpu, &account, &filter()).starts_with("sum(slurm_job:used_core:sum_user_account"));
        assert_eq!(levelfs(&account, &filter()), r#"slurm_account_levelfs{account="rrg-alice", cluster="narval"}"#);
    }

    #[test]
    fn job__selects_by_slurmjobid() {
        assert_eq!(
            job::gpu_utilization(4242, &filter()),
            r#"sum(slurm_job_utilization_gpu{slurmjobid="4242", cluster="narval"}) by (gpu)"#
        );
    }
}
