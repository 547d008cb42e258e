//! Request handling independent of HTTP: authorize, plan, fetch, map.

use std::{ops::Range, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use color_eyre::eyre::eyre;
use futures::future::try_join_all;
use itertools::Itertools as _;
use portal_data::{
    account::{assoc_ids, Assoc, SlurmAccount, SlurmUser},
    allocation::{AccountAllocation, Allocation, AllocationSummary},
    chart::Chart,
    graph::{
        priority_chart, AccountGraph, AccountPlan, GraphContext, GraphPlan, JobGraph, JobTarget, PriorityQueries, UserGraph,
    },
    job::{CostRates, JobCost, JobRecord},
    pagination::{Page, Paginator},
    promql::{EnvFilter, PriorityKind},
    series::Series,
    window::Window,
};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{
    allocations::AllocationSource, auth::Identity, config::Settings, error::PortalError, prometheus::MetricsSource,
    slurmdb::JobStore,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PortalOptions {
    pub filter: EnvFilter,
    pub gpu_power_watts: u32,
    pub page_size: u64,
    pub cost: CostRates,
}

impl Default for PortalOptions {
    fn default() -> Self {
        Self {
            filter: EnvFilter::default(),
            gpu_power_watts: 300,
            page_size: portal_data::PAGE_SIZE,
            cost: CostRates::default(),
        }
    }
}

impl From<&Settings> for PortalOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            filter: settings.prometheus.filter.clone(),
            gpu_power_watts: settings.gpu_power_watts,
            page_size: settings.page_size,
            cost: settings.cost,
        }
    }
}

/// Account page payload: allocation metadata and one page of jobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummary {
    pub account: SlurmAccount,
    #[serde(flatten)]
    pub allocation: AllocationSummary,
    pub jobs: Page<JobRecord>,
}

#[derive(Clone)]
pub struct Portal {
    metrics: Arc<dyn MetricsSource>,
    jobs: Arc<dyn JobStore>,
    allocations: Arc<dyn AllocationSource>,
    options: PortalOptions,
}

impl Portal {
    pub fn new(
        metrics: Arc<dyn MetricsSource>,
        jobs: Arc<dyn JobStore>,
        allocations: Arc<dyn AllocationSource>,
        options: PortalOptions,
    ) -> Self {
        Self {
            metrics,
            jobs,
            allocations,
            options,
        }
    }

    fn ctx(&self) -> GraphContext<'_> {
        GraphContext {
            filter: &self.options.filter,
            gpu_power_watts: self.options.gpu_power_watts,
        }
    }

    async fn account_assocs(&self, identity: &Identity, account: &SlurmAccount) -> Result<Vec<Assoc>, PortalError> {
        let assocs = self.jobs.assocs_for_account(account).await.map_err(PortalError::Database)?;
        identity.authorize_account(account, &assocs)?;
        Ok(assocs)
    }

    async fn user_assocs(&self, identity: &Identity, user: &SlurmUser) -> Result<Vec<Assoc>, PortalError> {
        identity.authorize_user(user)?;
        self.jobs.assocs_for_user(user).await.map_err(PortalError::Database)
    }

    async fn allocation(&self, account: &SlurmAccount) -> Result<Option<Allocation>, PortalError> {
        self.allocations.allocation(account).await.map_err(PortalError::Allocation)
    }

    async fn fetch(&self, query: &str, range: Range<DateTime<Utc>>, step: Duration) -> Result<Vec<Series>, PortalError> {
        self.metrics
            .query_range(query, range, step)
            .await
            .map_err(|e| PortalError::Upstream(e.wrap_err(format!("running `{query}`"))))
    }

    /// Queries run concurrently, the first failure fails the graph.
    async fn run(&self, plan: GraphPlan, now: DateTime<Utc>) -> Result<Chart, PortalError> {
        let range = plan.window.range(now);
        let step = plan.window.step();
        debug!(queries = plan.queries.len(), ?range, ?step, "fetching graph");
        let results = try_join_all(plan.queries.iter().map(|query| self.fetch(&query.query, range.clone(), step))).await?;
        plan.into_chart(results).map_err(PortalError::Upstream)
    }

    /// Queries that must return exactly one series (sums over the whole account).
    async fn fetch_single(&self, query: &str, window: Window, now: DateTime<Utc>) -> Result<Series, PortalError> {
        let mut series = self.fetch(query, window.range(now), window.step()).await?;
        if series.is_empty() {
            return Err(PortalError::Upstream(eyre!("`{query}` returned no series")));
        }
        Ok(series.swap_remove(0))
    }

    async fn priority(&self, kind: PriorityKind, account: &SlurmAccount, now: DateTime<Utc>) -> Result<Chart, PortalError> {
        let queries = PriorityQueries::new(kind, account, &self.options.filter);
        let (allocated, used, levelfs, allocation) = tokio::try_join!(
            self.fetch_single(&queries.allocated, Window::Long, now),
            self.fetch_single(&queries.used, Window::Long, now),
            self.fetch_single(&queries.levelfs, Window::Long, now),
            self.allocation(account),
        )?;
        Ok(priority_chart(kind, account, allocation, &allocated, &used, &levelfs))
    }

    #[instrument(skip(self, identity), fields(requester = %identity.user))]
    pub async fn account_graph(
        &self,
        identity: &Identity,
        account: &SlurmAccount,
        graph: AccountGraph,
        now: DateTime<Utc>,
    ) -> Result<Chart, PortalError> {
        self.account_assocs(identity, account).await?;
        match graph.plan(account, self.ctx()) {
            AccountPlan::Lines(plan) => self.run(plan, now).await,
            AccountPlan::Priority(kind) => self.priority(kind, account, now).await,
        }
    }

    #[instrument(skip(self, identity), fields(requester = %identity.user))]
    pub async fn user_graph(
        &self,
        identity: &Identity,
        user: &SlurmUser,
        graph: UserGraph,
        now: DateTime<Utc>,
    ) -> Result<Chart, PortalError> {
        identity.authorize_user(user)?;
        self.run(graph.plan(user, self.ctx()), now).await
    }

    /// A job charged to one of the user's associations, anything else is not found.
    #[instrument(skip(self, identity), fields(requester = %identity.user))]
    pub async fn job(&self, identity: &Identity, user: &SlurmUser, job_id: u32) -> Result<JobRecord, PortalError> {
        let assocs = self.user_assocs(identity, user).await?;
        self.jobs
            .job(&assoc_ids(&assocs), job_id)
            .await
            .map_err(PortalError::Database)?
            .ok_or_else(|| PortalError::not_found(format!("job {job_id} of {user}")))
    }

    /// The job must also have started.
    #[instrument(skip(self, identity), fields(requester = %identity.user))]
    pub async fn job_graph(
        &self,
        identity: &Identity,
        user: &SlurmUser,
        job_id: u32,
        graph: JobGraph,
        now: DateTime<Utc>,
    ) -> Result<Chart, PortalError> {
        let job = self.job(identity, user, job_id).await?;
        let window = job
            .run_window(now)
            .ok_or_else(|| PortalError::not_found(format!("runtime of job {job_id} (not started yet)")))?;
        let nodes = if graph.uses_nodes() {
            job.nodes().map_err(PortalError::Database)?
        } else {
            Vec::new()
        };
        let target = JobTarget {
            job_id,
            nodes: &nodes,
            window,
        };
        self.run(graph.plan(target, self.ctx()), now).await
    }

    #[instrument(skip(self, identity), fields(requester = %identity.user))]
    pub async fn job_cost(
        &self,
        identity: &Identity,
        user: &SlurmUser,
        job_id: u32,
        now: DateTime<Utc>,
    ) -> Result<JobCost, PortalError> {
        let job = self.job(identity, user, job_id).await?;
        Ok(JobCost::new(&job, self.options.cost, now))
    }

    async fn job_page(&self, assocs: &[Assoc], page: Option<&str>) -> Result<Page<JobRecord>, PortalError> {
        let ids = assoc_ids(assocs);
        let count = self.jobs.count_jobs(&ids).await.map_err(PortalError::Database)?;
        let paginator = Paginator::new(count, self.options.page_size);
        let slice = paginator.slice(page);
        let jobs = self
            .jobs
            .jobs(&ids, slice.offset, slice.limit)
            .await
            .map_err(PortalError::Database)?;
        Ok(paginator.page(slice, jobs))
    }

    /// Accounts without any association are not found (after authorization, so staff and
    /// members learn about it but nobody else does).
    #[instrument(skip(self, identity), fields(requester = %identity.user))]
    pub async fn account_summary(
        &self,
        identity: &Identity,
        account: &SlurmAccount,
        page: Option<&str>,
    ) -> Result<AccountSummary, PortalError> {
        let assocs = self.account_assocs(identity, account).await?;
        if assocs.is_empty() {
            return Err(PortalError::not_found(format!("account {account}")));
        }
        let (allocation, jobs) = tokio::try_join!(self.allocation(account), self.job_page(&assocs, page))?;
        Ok(AccountSummary {
            account: account.clone(),
            allocation: allocation.into(),
            jobs,
        })
    }

    #[instrument(skip(self, identity), fields(requester = %identity.user))]
    pub async fn user_jobs(&self, identity: &Identity, user: &SlurmUser, page: Option<&str>) -> Result<Page<JobRecord>, PortalError> {
        let assocs = self.user_assocs(identity, user).await?;
        if assocs.is_empty() {
            return Err(PortalError::not_found(format!("user {user}")));
        }
        self.job_page(&assocs, page).await
    }

    /// Every account the requester has an association in, with its allocation.
    #[instrument(skip(self, identity), fields(requester = %identity.user))]
    pub async fn accounts_of(&self, identity: &Identity) -> Result<Vec<AccountAllocation>, PortalError> {
        let assocs = self.jobs.assocs_for_user(&identity.user).await.map_err(PortalError::Database)?;
        let accounts = assocs.into_iter().map(|assoc| assoc.account).sorted().dedup().collect_vec();
        try_join_all(accounts.into_iter().map(|account| async move {
            let allocation = self.allocation(&account).await?;
            Ok::<_, PortalError>(AccountAllocation {
                account,
                allocation: allocation.into(),
            })
        }))
        .await
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use async_trait::async_trait;
    use chrono::TimeZone as _;
    use color_eyre::Result;
    use itertools::Itertools as _;
    use portal_data::{allocation::AllocationTable, job::JobState};

    use super::*;
    use crate::allocations::FileAllocations;

    /// Answers every query with the same series and records what was asked.
    #[derive(Default)]
    struct CannedMetrics {
        answer: Vec<Series>,
        asked: Mutex<Vec<(String, Duration)>>,
    }

    #[async_trait]
    impl MetricsSource for CannedMetrics {
        async fn query_range(&self, query: &str, _range: Range<DateTime<Utc>>, step: Duration) -> Result<Vec<Series>> {
            self.asked.lock().unwrap().push((query.to_owned(), step));
            Ok(self.answer.clone())
        }
    }

    #[derive(Default)]
    struct Assocs(Vec<Assoc>, HashMap<u32, JobRecord>);

    #[async_trait]
    impl JobStore for Assocs {
        async fn assocs_for_account(&self, account: &SlurmAccount) -> Result<Vec<Assoc>> {
            Ok(self.0.iter().filter(|a| &a.account == account).cloned().collect())
        }
        async fn assocs_for_user(&self, user: &SlurmUser) -> Result<Vec<Assoc>> {
            Ok(self.0.iter().filter(|a| &a.user == user).cloned().collect())
        }
        async fn count_jobs(&self, assoc_ids: &[u32]) -> Result<u64> {
            Ok(self.1.values().filter(|j| assoc_ids.contains(&j.id_assoc)).count() as u64)
        }
        async fn jobs(&self, assoc_ids: &[u32], offset: u64, limit: u64) -> Result<Vec<JobRecord>> {
            Ok(self
                .1
                .values()
                .filter(|j| assoc_ids.contains(&j.id_assoc))
                .sorted_by_key(|j| j.id_job)
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }
        async fn job(&self, assoc_ids: &[u32], id_job: u32) -> Result<Option<JobRecord>> {
            Ok(self.1.get(&id_job).filter(|j| assoc_ids.contains(&j.id_assoc)).cloned())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 16, 12, 0, 0).unwrap()
    }

    fn series(user: &str) -> Series {
        Series::new([("user", user)], vec![(now(), 2.0)])
    }

    fn assoc(id: u32, user: &str, account: &str) -> Assoc {
        Assoc {
            id_assoc: id,
            user: user.into(),
            account: account.into(),
            partition: String::new(),
        }
    }

    fn job(id_job: u32, id_assoc: u32, start: u64) -> JobRecord {
        JobRecord {
            job_db_inx: u64::from(id_job),
            id_job,
            id_assoc,
            user: "alice".into(),
            job_name: "train".to_owned(),
            partition: String::new(),
            state: JobState::Running,
            cpus_req: 1,
            gpus: 0,
            nodelist: "nc[10001-10002]".to_owned(),
            time_submit: portal_data::job::from_epoch(start),
            time_start: portal_data::job::from_epoch(start),
            time_end: None,
        }
    }

    fn alice() -> Identity {
        Identity {
            user: "alice".into(),
            staff: false,
        }
    }

    fn portal(metrics: Arc<CannedMetrics>, store: Assocs, table: AllocationTable, page_size: u64) -> Portal {
        Portal::new(
            metrics,
            Arc::new(store),
            Arc::new(FileAllocations::from(table)),
            PortalOptions {
                page_size,
                ..Default::default()
            },
        )
    }

    #[test_log::test(tokio::test)]
    async fn Portal__account_graph__member_gets_lines() {
        let metrics = Arc::new(CannedMetrics {
            answer: vec![series("alice"), series("bob")],
            ..Default::default()
        });
        let store = Assocs(vec![assoc(1, "alice", "def-alice"), assoc(2, "bob", "def-alice")], HashMap::new());
        let portal = portal(metrics.clone(), store, AllocationTable::default(), 100);

        let chart = portal
            .account_graph(&alice(), &"def-alice".into(), AccountGraph::CpuUsed, now())
            .await
            .unwrap();
        assert_eq!(chart.lines.len(), 2);
        assert_eq!(metrics.asked.lock().unwrap()[0].1, Duration::minutes(5));
    }

    #[test_log::test(tokio::test)]
    async fn Portal__account_graph__stranger_forbidden_before_fetch() {
        let metrics = Arc::new(CannedMetrics::default());
        let store = Assocs(vec![assoc(2, "bob", "def-bob")], HashMap::new());
        let portal = portal(metrics.clone(), store, AllocationTable::default(), 100);

        let result = portal.account_graph(&alice(), &"def-bob".into(), AccountGraph::LustreOst, now()).await;
        assert!(matches!(result, Err(PortalError::Forbidden { .. })));
        assert!(metrics.asked.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn Portal__account_graph__priority_with_allocation() {
        let metrics = Arc::new(CannedMetrics {
            answer: vec![Series::new([("account", "rrg-alice")], vec![(now(), 4.0)])],
            ..Default::default()
        });
        let store = Assocs(vec![assoc(1, "alice", "rrg-alice")], HashMap::new());
        let table: AllocationTable = [("rrg-alice".into(), Allocation::Gpu(8))].into_iter().collect();
        let portal = portal(metrics.clone(), store, table, 100);

        let chart = portal
            .account_graph(&alice(), &"rrg-alice".into(), AccountGraph::GpuPriority, now())
            .await
            .unwrap();
        assert_eq!(chart.lines.len(), 4);
        assert_eq!(chart.lines[1].y, vec![8.0]);
        let asked = metrics.asked.lock().unwrap();
        assert_eq!(asked.len(), 3);
        assert!(asked.iter().all(|(_, step)| *step == Duration::hours(1)));
    }

    #[test_log::test(tokio::test)]
    async fn Portal__account_graph__priority_without_series_is_upstream_error() {
        let metrics = Arc::new(CannedMetrics::default());
        let store = Assocs(vec![assoc(1, "alice", "rrg-alice")], HashMap::new());
        let portal = portal(metrics, store, AllocationTable::default(), 100);

        let result = portal.account_graph(&alice(), &"rrg-alice".into(), AccountGraph::CpuPriority, now()).await;
        assert!(matches!(result, Err(PortalError::Upstream(_))));
    }

    #[test_log::test(tokio::test)]
    async fn Portal__account_summary__pages_and_allocation() {
        let jobs = (1..=250).map(|id| (id, job(id, 1, 1_734_307_200))).collect();
        let store = Assocs(vec![assoc(1, "alice", "rrg-alice")], jobs);
        let table: AllocationTable = [("rrg-alice".into(), Allocation::Cpu(64))].into_iter().collect();
        let portal = portal(Arc::default(), store, table, 100);

        let summary = portal.account_summary(&alice(), &"rrg-alice".into(), Some("7")).await.unwrap();
        assert_eq!(summary.jobs.number, 3);
        assert_eq!(summary.jobs.count, 250);
        assert_eq!(summary.jobs.items.len(), 50);
        assert_eq!(summary.allocation.cpu_count, Some(64));
        assert_eq!(summary.allocation.gpu_count, None);
    }

    #[test_log::test(tokio::test)]
    async fn Portal__account_summary__unknown_account() {
        let staff = Identity {
            user: "root".into(),
            staff: true,
        };
        let portal = portal(Arc::default(), Assocs::default(), AllocationTable::default(), 100);
        let result = portal.account_summary(&staff, &"def-nobody".into(), None).await;
        assert!(matches!(result, Err(PortalError::NotFound(_))));
    }

    #[test_log::test(tokio::test)]
    async fn Portal__job_graph__ownership_and_start() {
        let jobs = HashMap::from([(10, job(10, 1, 1_734_307_200)), (11, job(11, 9, 1_734_307_200)), (12, job(12, 1, 0))]);
        let metrics = Arc::new(CannedMetrics::default());
        let store = Assocs(vec![assoc(1, "alice", "def-alice")], jobs);
        let portal = portal(metrics.clone(), store, AllocationTable::default(), 100);
        let alice_user = SlurmUser::from("alice");

        assert!(portal.job_graph(&alice(), &alice_user, 10, JobGraph::Cpu, now()).await.is_ok());
        assert!(matches!(
            portal.job_graph(&alice(), &alice_user, 11, JobGraph::Cpu, now()).await,
            Err(PortalError::NotFound(_))
        ));
        assert!(matches!(
            portal.job_graph(&alice(), &alice_user, 12, JobGraph::Cpu, now()).await,
            Err(PortalError::NotFound(_))
        ));
        assert!(matches!(
            portal.job_graph(&alice(), &"bob".into(), 10, JobGraph::Cpu, now()).await,
            Err(PortalError::Forbidden { .. })
        ));
        // 12h of runtime, clamped to one sample per minute
        assert_eq!(metrics.asked.lock().unwrap()[0].1, Duration::seconds(60));
    }

    #[test_log::test(tokio::test)]
    async fn Portal__job_graph__node_graphs_use_job_hosts() {
        let mut broken = job(13, 1, 1_734_307_200);
        broken.nodelist = "nc[10001-".to_owned();
        let jobs = HashMap::from([(10, job(10, 1, 1_734_307_200)), (13, broken)]);
        let metrics = Arc::new(CannedMetrics::default());
        let store = Assocs(vec![assoc(1, "alice", "def-alice")], jobs);
        let portal = portal(metrics.clone(), store, AllocationTable::default(), 100);
        let alice_user = SlurmUser::from("alice");

        portal
            .job_graph(&alice(), &alice_user, 10, JobGraph::DiskIops, now())
            .await
            .unwrap();
        {
            let asked = metrics.asked.lock().unwrap();
            assert_eq!(asked.len(), 2);
            assert!(asked.iter().all(|(query, _)| query.contains("(nc10001|nc10002)")));
        }

        // the host list is only needed by node graphs
        assert!(portal.job_graph(&alice(), &alice_user, 13, JobGraph::Cpu, now()).await.is_ok());
        assert!(matches!(
            portal.job_graph(&alice(), &alice_user, 13, JobGraph::Power, now()).await,
            Err(PortalError::Database(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn Portal__job_cost() {
        let mut gpu_job = job(20, 1, 1_734_307_200);
        gpu_job.cpus_req = 4;
        gpu_job.gpus = 1;
        let store = Assocs(vec![assoc(1, "alice", "def-alice")], HashMap::from([(20, gpu_job)]));
        let portal = Portal::new(
            Arc::new(CannedMetrics::default()),
            Arc::new(store),
            Arc::new(FileAllocations::from(AllocationTable::default())),
            PortalOptions {
                cost: CostRates {
                    cpu_core_hour: 0.5,
                    gpu_hour: 3.0,
                },
                ..Default::default()
            },
        );

        // still running, 12h so far
        let cost = portal.job_cost(&alice(), &"alice".into(), 20, now()).await.unwrap();
        assert_eq!(cost.core_hours, 48.0);
        assert_eq!(cost.gpu_hours, 12.0);
        assert_eq!(cost.total, 24.0 + 36.0);

        assert!(matches!(
            portal.job_cost(&alice(), &"alice".into(), 21, now()).await,
            Err(PortalError::NotFound(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn Portal__accounts_of() {
        let store = Assocs(
            vec![assoc(1, "alice", "rrg-alice"), assoc(2, "alice", "def-alice"), assoc(3, "alice", "rrg-alice")],
            HashMap::new(),
        );
        let table: AllocationTable = [("rrg-alice".into(), Allocation::Gpu(2))].into_iter().collect();
        let portal = portal(Arc::default(), store, table, 100);

        let accounts = portal.accounts_of(&alice()).await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].account, SlurmAccount::from("def-alice"));
        assert_eq!(accounts[0].allocation, AllocationSummary::default());
        assert_eq!(accounts[1].allocation.gpu_count, Some(2));
    }
}
