//! Bare server-rendered pages. Graph containers only carry the URL of their chart JSON,
//! drawing them is up to whatever script the deployment serves alongside.

use chrono::{DateTime, Utc};
use maud::{html, Markup, DOCTYPE};
use portal_data::{
    account::SlurmUser,
    allocation::{AccountAllocation, AllocationSummary},
    graph::{AccountGraph, JobGraph, UserGraph},
    job::JobRecord,
    pagination::Page,
    TIMESTAMP_FMT,
};

use crate::portal::AccountSummary;

fn layout(title: &str, body: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html {
            head {
                meta charset="utf-8";
                title { (title) }
            }
            body {
                h1 { (title) }
                (body)
            }
        }
    }
}

fn time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format(TIMESTAMP_FMT).to_string()).unwrap_or_else(|| "-".to_owned())
}

fn graph(url: &str, name: &str) -> Markup {
    html! {
        div.graph data-url=(url) {
            a href=(url) { (name) }
        }
    }
}

/// GPU accounts get the GPU families, everything else the CPU ones.
fn account_graphs(allocation: &AllocationSummary) -> Vec<AccountGraph> {
    use AccountGraph::*;

    let mut graphs = if allocation.gpu == Some(true) {
        vec![GpuAllocated, GpuUsed, GpuWasted, GpuPowerAllocated, GpuPowerUsed, GpuPowerWasted]
    } else {
        vec![CpuAllocated, CpuUsed, CpuWasted]
    };
    graphs.extend([MemAllocated, MemUsed, MemWasted, LustreMdt, LustreOst]);
    graphs.push(if allocation.gpu == Some(true) { GpuPriority } else { CpuPriority });
    graphs
}

fn allocation_text(allocation: &AllocationSummary) -> String {
    match (allocation.cpu_count, allocation.gpu_count) {
        (Some(cpus), _) => format!("CPU allocation: {cpus} cores"),
        (None, Some(gpus)) => format!("GPU allocation: {gpus} GPUs"),
        (None, None) => "No allocation".to_owned(),
    }
}

fn pager<T>(base: &str, page: &Page<T>) -> Markup {
    html! {
        nav.pager {
            @if page.has_previous {
                a href=(format!("{base}?page=1")) { "first" } " "
                a href=(format!("{base}?page={}", page.number - 1)) { "previous" } " "
            }
            span { "Page " (page.number) " of " (page.num_pages) " (" (page.count) " jobs)" }
            @if page.has_next {
                " " a href=(format!("{base}?page={}", page.number + 1)) { "next" }
                " " a href=(format!("{base}?page={}", page.num_pages)) { "last" }
            }
        }
    }
}

fn jobs_table(jobs: &[JobRecord]) -> Markup {
    html! {
        table.jobs {
            thead {
                tr {
                    th { "Job ID" } th { "User" } th { "Name" } th { "Partition" } th { "State" }
                    th { "CPUs" } th { "Submitted" } th { "Started" } th { "Ended" }
                }
            }
            tbody {
                @for job in jobs {
                    tr {
                        td { a href=(format!("/jobstats/{}/{}", job.user, job.id_job)) { (job.id_job) } }
                        td { a href=(format!("/jobstats/{}", job.user)) { (job.user) } }
                        td { (job.job_name) }
                        td { (job.partition) }
                        td { (job.state) }
                        td { (job.cpus_req) }
                        td { (time(job.time_submit)) }
                        td { (time(job.time_start)) }
                        td { (time(job.time_end)) }
                    }
                }
            }
        }
    }
}

pub fn index_page(user: &SlurmUser, accounts: &[AccountAllocation]) -> Markup {
    layout(
        &format!("Accounts of {user}"),
        html! {
            @if accounts.is_empty() {
                p { "You are not a member of any account." }
            } @else {
                ul.accounts {
                    @for account in accounts {
                        li {
                            a href=(format!("/accountstats/{}", account.account)) { (account.account) }
                            " " (allocation_text(&account.allocation))
                        }
                    }
                }
            }
        },
    )
}

pub fn account_page(summary: &AccountSummary) -> Markup {
    let base = format!("/accountstats/{}", summary.account);
    layout(
        &format!("Account {}", summary.account),
        html! {
            p.allocation { (allocation_text(&summary.allocation)) }
            section.graphs {
                @for graph_name in account_graphs(&summary.allocation) {
                    (graph(&format!("{base}/graph/{}.json", graph_name.name()), graph_name.name()))
                }
            }
            (jobs_table(&summary.jobs.items))
            (pager(&base, &summary.jobs))
        },
    )
}

pub fn user_page(user: &SlurmUser, jobs: &Page<JobRecord>) -> Markup {
    let base = format!("/jobstats/{user}");
    layout(
        &format!("Jobs of {user}"),
        html! {
            section.graphs {
                @for graph_name in UserGraph::ALL {
                    (graph(&format!("{base}/graph/{}.json", graph_name.name()), graph_name.name()))
                }
            }
            (jobs_table(&jobs.items))
            (pager(&base, jobs))
        },
    )
}

/// Details and graphs of one job. GPU graphs only for jobs that were given GPUs.
pub fn job_page(job: &JobRecord) -> Markup {
    let base = format!("/jobstats/{}/{}", job.user, job.id_job);
    layout(
        &format!("Job {}", job.id_job),
        html! {
            dl.job {
                dt { "User" } dd { a href=(format!("/jobstats/{}", job.user)) { (job.user) } }
                dt { "Name" } dd { (job.job_name) }
                dt { "Partition" } dd { (job.partition) }
                dt { "State" } dd { (job.state) }
                dt { "CPUs" } dd { (job.cpus_req) }
                dt { "GPUs" } dd { (job.gpus) }
                dt { "Nodes" } dd { (job.nodelist) }
                dt { "Submitted" } dd { (time(job.time_submit)) }
                dt { "Started" } dd { (time(job.time_start)) }
                dt { "Ended" } dd { (time(job.time_end)) }
                dt { "Cost" } dd { a href=(format!("{base}/value/cost.json")) { "cost.json" } }
            }
            @if job.time_start.is_some() {
                section.graphs {
                    @for graph_name in JobGraph::ALL.iter().filter(|graph| job.gpus > 0 || !graph.is_gpu()) {
                        (graph(&format!("{base}/graph/{}.json", graph_name.name()), graph_name.name()))
                    }
                }
            } @else {
                p { "The job has not started yet." }
            }
        },
    )
}
