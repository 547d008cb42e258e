use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use color_eyre::{
    eyre::{ensure, eyre, Context as _},
    Result,
};
use serde::{Deserialize, Serialize, Serializer};

use crate::{account::SlurmUser, window::Window};

/// Base job state as stored by slurmdbd in `job_table.state`. Only the low byte is the
/// state, the rest are flags (requeued, resizing, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    Preempted,
    BootFail,
    Deadline,
    OutOfMemory,
    Unknown(u32),
}

const JOB_STATE_BASE: u32 = 0xff;

impl JobState {
    pub fn from_raw(raw: u32) -> Self {
        match raw & JOB_STATE_BASE {
            0 => JobState::Pending,
            1 => JobState::Running,
            2 => JobState::Suspended,
            3 => JobState::Completed,
            4 => JobState::Cancelled,
            5 => JobState::Failed,
            6 => JobState::Timeout,
            7 => JobState::NodeFail,
            8 => JobState::Preempted,
            9 => JobState::BootFail,
            10 => JobState::Deadline,
            11 => JobState::OutOfMemory,
            other => JobState::Unknown(other),
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::NodeFail => "NODE_FAIL",
            JobState::Preempted => "PREEMPTED",
            JobState::BootFail => "BOOT_FAIL",
            JobState::Deadline => "DEADLINE",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
            JobState::Unknown(_) => "UNKNOWN",
        };
        f.write_str(name)
    }
}

impl Serialize for JobState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// slurmdbd stores unset times as 0.
pub fn from_epoch(secs: u64) -> Option<DateTime<Utc>> {
    match secs {
        0 => None,
        secs => DateTime::from_timestamp(i64::try_from(secs).ok()?, 0),
    }
}

/// The columns of `<cluster>_job_table` the portal shows, with the user resolved through
/// the association.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_db_inx: u64,
    pub id_job: u32,
    pub id_assoc: u32,
    pub user: SlurmUser,
    pub job_name: String,
    pub partition: String,
    pub state: JobState,
    pub cpus_req: u32,
    /// GPUs from the allocated TRES, 0 for CPU jobs.
    pub gpus: u32,
    /// Compressed host list, `nc[10001-10003],gpu1`.
    pub nodelist: String,
    pub time_submit: Option<DateTime<Utc>>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// From start to end, or to `now` while still running. `None` if it never started.
    pub fn run_window(&self, now: DateTime<Utc>) -> Option<Window> {
        let start = self.time_start?;
        let end = self.time_end.unwrap_or(now).max(start);
        Some(Window::Between { start, end })
    }

    pub fn nodes(&self) -> Result<Vec<String>> {
        expand_nodelist(&self.nodelist)
    }
}

/// Count of one TRES in a slurmdbd TRES string (`1=4,2=16000,4=1,1001=2`).
pub fn tres_count(tres: &str, id: u32) -> Option<u64> {
    tres.split(',')
        .filter_map(|entry| entry.split_once('='))
        .find(|(key, _)| key.trim().parse::<u32>().ok() == Some(id))
        .and_then(|(_, count)| count.trim().parse().ok())
}

/// Refuses ranges that would expand into more hosts than any cluster has.
const MAX_RANGE: u64 = 100_000;

/// Expands a Slurm host list: `nc[10001-10003,10005],gpu[01-02]` gives nc10001, nc10002,
/// nc10003, nc10005, gpu01, gpu02. Zero padding follows the lower bound. Jobs that never
/// got nodes have an empty list.
pub fn expand_nodelist(nodelist: &str) -> Result<Vec<String>> {
    let nodelist = nodelist.trim();
    if nodelist.is_empty() || nodelist == "None assigned" {
        return Ok(Vec::new());
    }
    let mut nodes = Vec::new();
    for item in split_hosts(nodelist)? {
        nodes.extend(expand_host(item).wrap_err_with(|| format!("in host list {nodelist:?}"))?);
    }
    Ok(nodes)
}

/// Splits on commas outside of brackets.
fn split_hosts(nodelist: &str) -> Result<Vec<&str>> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in nodelist.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.checked_sub(1).ok_or_else(|| eyre!("unbalanced `]` in {nodelist:?}"))?,
            ',' if depth == 0 => {
                items.push(&nodelist[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    ensure!(depth == 0, "unbalanced `[` in {nodelist:?}");
    items.push(&nodelist[start..]);
    Ok(items.into_iter().filter(|item| !item.is_empty()).collect())
}

fn expand_host(host: &str) -> Result<Vec<String>> {
    let Some((prefix, rest)) = host.split_once('[') else {
        return Ok(vec![host.to_owned()]);
    };
    let (ranges, suffix) = rest.split_once(']').ok_or_else(|| eyre!("unclosed `[` in {host:?}"))?;
    let tails = expand_host(suffix)?;
    let mut hosts = Vec::new();
    for range in ranges.split(',') {
        for number in expand_range(range)? {
            hosts.extend(tails.iter().map(|tail| format!("{prefix}{number}{tail}")));
        }
    }
    Ok(hosts)
}

fn expand_range(range: &str) -> Result<Vec<String>> {
    let (low, high) = range.split_once('-').unwrap_or((range, range));
    let width = low.len();
    let low: u64 = low.parse().wrap_err_with(|| format!("bad range {range:?}"))?;
    let high: u64 = high.parse().wrap_err_with(|| format!("bad range {range:?}"))?;
    ensure!(low <= high && high - low < MAX_RANGE, "bad range {range:?}");
    Ok((low..=high).map(|n| format!("{n:0width$}")).collect())
}

/// Price of one core hour and one GPU hour.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CostRates {
    pub cpu_core_hour: f64,
    pub gpu_hour: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            cpu_core_hour: 0.01,
            gpu_hour: 0.5,
        }
    }
}

/// What a job consumed so far, `value/cost.json`. Jobs that have not started cost nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobCost {
    pub elapsed_hours: f64,
    pub core_hours: f64,
    pub gpu_hours: f64,
    pub cpu_cost: f64,
    pub gpu_cost: f64,
    pub total: f64,
}

impl JobCost {
    pub fn new(job: &JobRecord, rates: CostRates, now: DateTime<Utc>) -> Self {
        let elapsed_hours = job
            .run_window(now)
            .map(|window| window.span().num_seconds() as f64 / 3600.0)
            .unwrap_or(0.0);
        let core_hours = elapsed_hours * f64::from(job.cpus_req);
        let gpu_hours = elapsed_hours * f64::from(job.gpus);
        let cpu_cost = core_hours * rates.cpu_core_hour;
        let gpu_cost = gpu_hours * rates.gpu_hour;
        Self {
            elapsed_hours,
            core_hours,
            gpu_hours,
            cpu_cost,
            gpu_cost,
            total: cpu_cost + gpu_cost,
        }
    }
}
