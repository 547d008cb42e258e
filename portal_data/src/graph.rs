//! Which queries each graph endpoint runs and how the answers become a [`Chart`].

use std::str::FromStr;

use color_eyre::{
    eyre::{bail, ensure},
    Result,
};
use itertools::Itertools as _;

use crate::{
    account::{SlurmAccount, SlurmUser},
    allocation::Allocation,
    chart::{Axis, Chart, Layout, Line, LineName},
    promql::{self, EnvFilter, IoDirection, PriorityKind, Resource, Scope, Usage},
    series::Series,
    window::Window,
};

/// Shown on every GPU power graph. Per-GPU power is attributed to the job as a whole, so
/// jobs with more than one GPU report inflated/duplicated figures.
pub const MULTI_GPU_POWER_WARNING: &str = "GPU power is unreliable for jobs using more than one GPU";

/// Settings every plan needs.
#[derive(Debug, Clone, Copy)]
pub struct GraphContext<'a> {
    pub filter: &'a EnvFilter,
    /// Power budget of one GPU in W, the "allocated" side of power graphs.
    pub gpu_power_watts: u32,
}

/// One query of a graph and what to do with each series it returns.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub query: String,
    pub name: LineName,
    pub stacked: bool,
    pub negate: bool,
}

impl QueryPlan {
    fn new(query: String, name: LineName) -> Self {
        Self {
            query,
            name,
            stacked: false,
            negate: false,
        }
    }

    fn stacked(mut self) -> Self {
        self.stacked = true;
        self
    }

    fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    fn lines(&self, results: &[Series]) -> Result<Vec<Line>> {
        results
            .iter()
            .map(|series| -> Result<Line> {
                let line = Line::from_series(series, self.name.for_series(series)?);
                let line = if self.stacked { line.stacked() } else { line };
                Ok(if self.negate { line.negated() } else { line })
            })
            .collect()
    }
}

/// Everything to fetch for a line graph: queries share one window.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphPlan {
    pub window: Window,
    pub queries: Vec<QueryPlan>,
    pub layout: Layout,
}

impl GraphPlan {
    fn single(window: Window, query: QueryPlan, layout: Layout) -> Self {
        Self {
            window,
            queries: vec![query],
            layout,
        }
    }

    /// `results[i]` are the series returned for `self.queries[i]`. Lines keep query order,
    /// then series order.
    pub fn into_chart(self, results: Vec<Vec<Series>>) -> Result<Chart> {
        ensure!(
            results.len() == self.queries.len(),
            "got results for {} queries, planned {}",
            results.len(),
            self.queries.len()
        );
        let lines: Vec<Line> = self
            .queries
            .iter()
            .zip(&results)
            .map(|(query, series)| query.lines(series))
            .process_results(|lines| lines.flatten().collect())?;
        Ok(Chart {
            lines,
            layout: self.layout,
        })
    }
}

/// Two-way traffic: `down` is mirrored below the axis.
fn mirrored(window: Window, up: QueryPlan, down: QueryPlan, layout: Layout) -> GraphPlan {
    GraphPlan {
        window,
        queries: vec![up, down.negated()],
        layout,
    }
}

/// Read and write OST traffic, write mirrored below the axis.
fn ost_plan(scope: Scope<'_>, name: &'static [&'static str], window: Window, filter: &EnvFilter) -> GraphPlan {
    let query = |direction: IoDirection| {
        QueryPlan::new(
            promql::lustre_ost(direction, scope, filter),
            LineName::labels(name).prefixed(direction.to_string()),
        )
    };
    mirrored(window, query(IoDirection::Read), query(IoDirection::Write), Layout::with_suffix(" MiB/s"))
}

fn power_layout() -> Layout {
    Layout::with_suffix(" W").annotate(MULTI_GPU_POWER_WARNING)
}

macro_rules! graph_names {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Endpoint name, without the `.json` suffix.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $str),+
                }
            }
        }

        impl FromStr for $name {
            type Err = color_eyre::Report;

            /// Accepts `cpu_used` as well as `cpu_used.json`.
            fn from_str(s: &str) -> Result<Self> {
                let s = s.strip_suffix(".json").unwrap_or(s);
                match s {
                    $($str => Ok($name::$variant),)+
                    other => bail!("unknown graph `{other}`"),
                }
            }
        }
    };
}

graph_names! {
    /// Graphs of one account, `/accountstats/{account}/graph/<name>.json`.
    pub enum AccountGraph {
        CpuAllocated => "cpu_allocated",
        CpuUsed => "cpu_used",
        CpuWasted => "cpu_wasted",
        MemAllocated => "mem_allocated",
        MemUsed => "mem_used",
        MemWasted => "mem_wasted",
        GpuAllocated => "gpu_allocated",
        GpuUsed => "gpu_used",
        GpuWasted => "gpu_wasted",
        GpuPowerAllocated => "gpu_power_allocated",
        GpuPowerUsed => "gpu_power_used",
        GpuPowerWasted => "gpu_power_wasted",
        LustreMdt => "lustre_mdt",
        LustreOst => "lustre_ost",
        CpuPriority => "cpu_priority",
        GpuPriority => "gpu_priority",
    }
}

graph_names! {
    /// Graphs of all jobs of one user, `/jobstats/{user}/graph/<name>.json`.
    pub enum UserGraph {
        Cpu => "cpu",
        Mem => "mem",
        LustreMdt => "lustre_mdt",
        LustreOst => "lustre_ost",
        GpuUtilization => "gpu_utilization",
        GpuPower => "gpu_power",
    }
}

graph_names! {
    /// Graphs of a single job, `/jobstats/{user}/{job_id}/graph/<name>.json`.
    pub enum JobGraph {
        Cpu => "cpu",
        Mem => "mem",
        LustreMdt => "lustre_mdt",
        LustreOst => "lustre_ost",
        GpuUtilization => "gpu_utilization",
        GpuMemoryUtilization => "gpu_memory_utilization",
        GpuMemory => "gpu_memory",
        GpuPower => "gpu_power",
        GpuPcie => "gpu_pcie",
        GpuNvlink => "gpu_nvlink",
        InfinibandBdw => "infiniband_bdw",
        DiskIops => "disk_iops",
        DiskBdw => "disk_bdw",
        DiskUsed => "disk_used",
        Power => "power",
    }
}

/// Account graphs are either plain line graphs or the priority graph, which mixes three
/// single-series queries with the allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountPlan {
    Lines(GraphPlan),
    Priority(PriorityKind),
}

impl AccountGraph {
    pub fn plan(self, account: &SlurmAccount, ctx: GraphContext<'_>) -> AccountPlan {
        use AccountGraph::*;

        let by_user = || LineName::labels(&["user"]);
        let usage = |resource, usage| QueryPlan::new(promql::account_usage(resource, usage, account, ctx.filter), by_user());
        let power = |usage| {
            QueryPlan::new(promql::account_gpu_power(usage, account, ctx.filter, ctx.gpu_power_watts), by_user()).stacked()
        };
        let gib = || Layout::with_suffix("GiB");

        let plan = match self {
            CpuAllocated => GraphPlan::single(Window::Short, usage(Resource::Cpu, Usage::Allocated).stacked(), Layout::default()),
            CpuUsed => GraphPlan::single(Window::Short, usage(Resource::Cpu, Usage::Used).stacked(), Layout::default()),
            CpuWasted => GraphPlan::single(Window::Short, usage(Resource::Cpu, Usage::Wasted), Layout::default()),
            MemAllocated => GraphPlan::single(Window::Short, usage(Resource::Memory, Usage::Allocated).stacked(), gib()),
            MemUsed => GraphPlan::single(Window::Short, usage(Resource::Memory, Usage::Used).stacked(), gib()),
            MemWasted => GraphPlan::single(Window::Short, usage(Resource::Memory, Usage::Wasted), gib()),
            GpuAllocated => GraphPlan::single(Window::Short, usage(Resource::Gpu, Usage::Allocated).stacked(), Layout::default()),
            GpuUsed => GraphPlan::single(Window::Short, usage(Resource::Gpu, Usage::Used).stacked(), Layout::default()),
            GpuWasted => GraphPlan::single(Window::Short, usage(Resource::Gpu, Usage::Wasted), Layout::default()),
            GpuPowerAllocated => GraphPlan::single(Window::Recent, power(Usage::Allocated), power_layout()),
            GpuPowerUsed => GraphPlan::single(Window::Recent, power(Usage::Used), power_layout()),
            GpuPowerWasted => GraphPlan::single(Window::Recent, power(Usage::Wasted), power_layout()),
            LustreMdt => GraphPlan::single(
                Window::Recent,
                QueryPlan::new(promql::lustre_mdt(Scope::Account(account), ctx.filter), LineName::labels(&["user", "fs"])).stacked(),
                Layout::with_suffix(" IOPS"),
            ),
            LustreOst => ost_plan(Scope::Account(account), &["fs", "user"], Window::Recent, ctx.filter),
            CpuPriority => return AccountPlan::Priority(PriorityKind::Cpu),
            GpuPriority => return AccountPlan::Priority(PriorityKind::Gpu),
        };
        AccountPlan::Lines(plan)
    }
}

impl UserGraph {
    pub fn plan(self, user: &SlurmUser, ctx: GraphContext<'_>) -> GraphPlan {
        let by_job = || LineName::labels(&["slurmjobid"]);
        match self {
            UserGraph::Cpu => GraphPlan::single(
                Window::Recent,
                QueryPlan::new(promql::user::cpu(user, ctx.filter), by_job()).stacked(),
                Layout::with_suffix(" cores"),
            ),
            UserGraph::Mem => GraphPlan::single(
                Window::Recent,
                QueryPlan::new(promql::user::memory(user, ctx.filter), by_job()).stacked(),
                Layout::with_suffix("GiB"),
            ),
            UserGraph::LustreMdt => GraphPlan::single(
                Window::Recent,
                QueryPlan::new(promql::lustre_mdt(Scope::User(user), ctx.filter), LineName::labels(&["fs"])).stacked(),
                Layout::with_suffix(" IOPS"),
            ),
            UserGraph::LustreOst => ost_plan(Scope::User(user), &["fs"], Window::Recent, ctx.filter),
            UserGraph::GpuUtilization => GraphPlan::single(
                Window::Recent,
                QueryPlan::new(promql::user::gpu_utilization(user, ctx.filter), by_job()).stacked(),
                Layout::with_suffix(" %"),
            ),
            UserGraph::GpuPower => GraphPlan::single(
                Window::Recent,
                QueryPlan::new(promql::user::gpu_power(user, ctx.filter), by_job()).stacked(),
                power_layout(),
            ),
        }
    }
}

/// What a job graph is drawn over.
#[derive(Debug, Clone, Copy)]
pub struct JobTarget<'a> {
    pub job_id: u32,
    /// Expanded host list, only read by node-level graphs.
    pub nodes: &'a [String],
    /// Runtime of the job.
    pub window: Window,
}

impl JobGraph {
    /// Only meaningful for jobs that were allocated GPUs.
    pub fn is_gpu(self) -> bool {
        use JobGraph::*;
        matches!(self, GpuUtilization | GpuMemoryUtilization | GpuMemory | GpuPower | GpuPcie | GpuNvlink)
    }

    /// Drawn from node exporters of the job's hosts rather than from per-job metrics.
    pub fn uses_nodes(self) -> bool {
        use JobGraph::*;
        matches!(self, InfinibandBdw | DiskIops | DiskBdw | DiskUsed | Power)
    }

    pub fn plan(self, target: JobTarget<'_>, ctx: GraphContext<'_>) -> GraphPlan {
        use promql::{job, node};
        use IoDirection::{Read, Write};

        let JobTarget { job_id, nodes, window } = target;
        let filter = ctx.filter;
        let by_gpu = || LineName::labels(&["gpu"]).prefixed("GPU");
        let by_gpu_direction = || LineName::labels(&["gpu", "direction"]).prefixed("GPU");
        let by_node = |prefix: &str| LineName::labels(&["instance"]).prefixed(prefix);
        match self {
            JobGraph::Cpu => GraphPlan::single(
                window,
                QueryPlan::new(job::cpu(job_id, filter), LineName::fixed("Cores")),
                Layout::with_suffix(" cores"),
            ),
            JobGraph::Mem => GraphPlan {
                window,
                queries: vec![
                    QueryPlan::new(job::memory_allocated(job_id, filter), LineName::fixed("Allocated")),
                    QueryPlan::new(job::memory_used(job_id, filter), LineName::fixed("Used")),
                ],
                layout: Layout::with_suffix("GiB"),
            },
            JobGraph::LustreMdt => GraphPlan::single(
                window,
                QueryPlan::new(promql::lustre_mdt(Scope::Job(job_id), filter), LineName::labels(&["fs"])).stacked(),
                Layout::with_suffix(" IOPS"),
            ),
            JobGraph::LustreOst => ost_plan(Scope::Job(job_id), &["fs"], window, filter),
            JobGraph::GpuUtilization => GraphPlan::single(
                window,
                QueryPlan::new(job::gpu_utilization(job_id, filter), by_gpu()),
                Layout::with_suffix(" %"),
            ),
            JobGraph::GpuMemoryUtilization => GraphPlan::single(
                window,
                QueryPlan::new(job::gpu_memory_utilization(job_id, filter), by_gpu()),
                Layout::with_suffix(" %"),
            ),
            JobGraph::GpuMemory => GraphPlan::single(
                window,
                QueryPlan::new(job::gpu_memory(job_id, filter), by_gpu()),
                Layout::with_suffix("GiB"),
            ),
            JobGraph::GpuPower => GraphPlan::single(
                window,
                QueryPlan::new(job::gpu_power(job_id, filter), by_gpu()).stacked(),
                power_layout(),
            ),
            JobGraph::GpuPcie => GraphPlan::single(
                window,
                QueryPlan::new(job::gpu_pcie(job_id, filter), by_gpu_direction()),
                Layout::with_suffix(" MiB/s"),
            ),
            JobGraph::GpuNvlink => GraphPlan::single(
                window,
                QueryPlan::new(job::gpu_nvlink(job_id, filter), by_gpu_direction()),
                Layout::with_suffix(" MiB/s"),
            ),
            JobGraph::InfinibandBdw => mirrored(
                window,
                QueryPlan::new(node::infiniband(Read, nodes, filter), by_node("received")),
                QueryPlan::new(node::infiniband(Write, nodes, filter), by_node("transmitted")),
                Layout::with_suffix(" MiB/s"),
            ),
            JobGraph::DiskIops => mirrored(
                window,
                QueryPlan::new(node::disk_iops(Read, nodes, filter), by_node("read")),
                QueryPlan::new(node::disk_iops(Write, nodes, filter), by_node("write")),
                Layout::with_suffix(" IOPS"),
            ),
            JobGraph::DiskBdw => mirrored(
                window,
                QueryPlan::new(node::disk_bandwidth(Read, nodes, filter), by_node("read")),
                QueryPlan::new(node::disk_bandwidth(Write, nodes, filter), by_node("write")),
                Layout::with_suffix(" MiB/s"),
            ),
            JobGraph::DiskUsed => GraphPlan::single(
                window,
                QueryPlan::new(node::disk_used(nodes, filter), LineName::labels(&["instance"])),
                Layout::with_suffix("GiB"),
            ),
            JobGraph::Power => GraphPlan::single(
                window,
                QueryPlan::new(node::power(nodes, filter), LineName::labels(&["instance"])).stacked(),
                Layout::with_suffix(" W"),
            ),
        }
    }
}

/// The three queries behind a priority graph, all over [`Window::Long`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityQueries {
    pub allocated: String,
    pub used: String,
    pub levelfs: String,
}

impl PriorityQueries {
    pub fn new(kind: PriorityKind, account: &SlurmAccount, filter: &EnvFilter) -> Self {
        Self {
            allocated: promql::priority_allocated(kind, account, filter),
            used: promql::priority_used(kind, account, filter),
            levelfs: promql::levelfs(account, filter),
        }
    }
}

/// Allocated and used cores/GPUs with the fairshare level on a second axis. The flat
/// allocation line is left out for `def-` accounts.
pub fn priority_chart(
    kind: PriorityKind,
    account: &SlurmAccount,
    allocation: Option<Allocation>,
    allocated: &Series,
    used: &Series,
    levelfs: &Series,
) -> Chart {
    let (unit, title) = match kind {
        PriorityKind::Cpu => ("cores", "Cores"),
        PriorityKind::Gpu => ("GPUs", "GPUs"),
    };

    let allocated_line = Line::from_series(allocated, format!("Allocated {unit}")).on_axis("y1");
    let mut lines = Vec::with_capacity(4);
    if !account.is_default() {
        let count = allocation.map(|alloc| alloc.count()).unwrap_or(0);
        lines.push(Line {
            y: vec![f64::from(count); allocated_line.x.len()],
            name: "Allocation".to_owned(),
            ..allocated_line.clone()
        });
    }
    lines.insert(0, allocated_line);
    lines.push(Line::from_series(used, format!("Used {unit}")).on_axis("y1"));
    lines.push(Line::from_series(levelfs, "Priority").on_axis("y2"));

    Chart {
        lines,
        layout: Layout {
            showlegend: true,
            yaxis: Some(Axis {
                title: Some(title.to_owned()),
                range: Some([0.0, allocated.max_value()]),
                ..Default::default()
            }),
            yaxis2: Some(Axis {
                title: Some("Priority".to_owned()),
                overlaying: Some("y"),
                side: Some("right"),
                range: Some([0.0, levelfs.max_value()]),
                ..Default::default()
            }),
            annotations: Vec::new(),
        },
    }
}
