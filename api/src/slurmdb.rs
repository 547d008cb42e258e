//! Read access to the slurmdbd accounting database.
//!
//! Only a handful of columns of `<cluster>_assoc_table` and `<cluster>_job_table` are read,
//! there is no schema of our own.

use async_trait::async_trait;
use color_eyre::{eyre::Context as _, Result};
use portal_data::{
    account::{Assoc, SlurmAccount, SlurmUser},
    job::{from_epoch, tres_count, JobRecord, JobState},
};
use sqlx::{
    mysql::{MySqlPool, MySqlPoolOptions},
    MySql, QueryBuilder,
};
use tracing::{info, instrument};

use crate::config::DatabaseSettings;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Undeleted associations of `account`.
    async fn assocs_for_account(&self, account: &SlurmAccount) -> Result<Vec<Assoc>>;
    /// Undeleted associations of `user`, over all accounts.
    async fn assocs_for_user(&self, user: &SlurmUser) -> Result<Vec<Assoc>>;
    async fn count_jobs(&self, assoc_ids: &[u32]) -> Result<u64>;
    /// Newest submission first.
    async fn jobs(&self, assoc_ids: &[u32], offset: u64, limit: u64) -> Result<Vec<JobRecord>>;
    /// `id_job` if it was charged to one of `assoc_ids`. The newest record wins for requeued ids.
    async fn job(&self, assoc_ids: &[u32], id_job: u32) -> Result<Option<JobRecord>>;
}

/// Table names of one cluster. The cluster name is validated on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    assoc: String,
    job: String,
}

const JOB_COLUMNS: &str = "j.job_db_inx, j.id_job, j.id_assoc, a.user, j.job_name, j.`partition`, j.state, \
                           j.cpus_req, j.tres_alloc, j.nodelist, j.time_submit, j.time_start, j.time_end";

impl Tables {
    pub fn new(cluster: &str) -> Self {
        Self {
            assoc: format!("{cluster}_assoc_table"),
            job: format!("{cluster}_job_table"),
        }
    }

    fn assocs_where(&self, column: &str) -> String {
        format!(
            "SELECT id_assoc, user, acct, `partition` FROM {} WHERE deleted = 0 AND {column} = ? ORDER BY acct, `partition`",
            self.assoc
        )
    }

    /// `SELECT <select> FROM jobs JOIN assocs WHERE j.id_assoc IN (<ids>)`, more clauses can be pushed.
    fn jobs_in<'a>(&self, select: &str, assoc_ids: &'a [u32]) -> QueryBuilder<'a, MySql> {
        let mut query = QueryBuilder::new(format!(
            "SELECT {select} FROM {} j JOIN {} a ON a.id_assoc = j.id_assoc WHERE j.deleted = 0 AND j.id_assoc IN (",
            self.job, self.assoc
        ));
        let mut ids = query.separated(", ");
        for id in assoc_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        query
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AssocRow {
    id_assoc: u32,
    user: String,
    acct: String,
    partition: String,
}

impl From<AssocRow> for Assoc {
    fn from(row: AssocRow) -> Self {
        Assoc {
            id_assoc: row.id_assoc,
            user: SlurmUser(row.user),
            account: SlurmAccount(row.acct),
            partition: row.partition,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_db_inx: u64,
    id_job: u32,
    id_assoc: u32,
    user: String,
    job_name: String,
    partition: String,
    state: u32,
    cpus_req: u32,
    tres_alloc: String,
    nodelist: String,
    time_submit: u64,
    time_start: u64,
    time_end: u64,
}

impl JobRow {
    /// `gpu_tres_id` is the id of `gres/gpu` in the cluster's `tres_table`.
    fn into_record(self, gpu_tres_id: u32) -> JobRecord {
        let gpus = tres_count(&self.tres_alloc, gpu_tres_id).and_then(|count| u32::try_from(count).ok());
        JobRecord {
            job_db_inx: self.job_db_inx,
            id_job: self.id_job,
            id_assoc: self.id_assoc,
            user: SlurmUser(self.user),
            job_name: self.job_name,
            partition: self.partition,
            state: JobState::from_raw(self.state),
            cpus_req: self.cpus_req,
            gpus: gpus.unwrap_or(0),
            nodelist: self.nodelist,
            time_submit: from_epoch(self.time_submit),
            time_start: from_epoch(self.time_start),
            time_end: from_epoch(self.time_end),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlurmDb {
    pool: MySqlPool,
    tables: Tables,
    gpu_tres_id: u32,
}

impl SlurmDb {
    /// Connections are opened on first use, the portal starts without the database.
    pub fn connect_lazy(settings: &DatabaseSettings) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect_lazy(&settings.url)
            .wrap_err("parsing database.url")?;
        info!(cluster = %settings.cluster, "using slurmdbd tables");
        Ok(Self {
            pool,
            tables: Tables::new(&settings.cluster),
            gpu_tres_id: settings.gpu_tres_id,
        })
    }
}

#[async_trait]
impl JobStore for SlurmDb {
    #[instrument(skip(self))]
    async fn assocs_for_account(&self, account: &SlurmAccount) -> Result<Vec<Assoc>> {
        let rows: Vec<AssocRow> = sqlx::query_as(&self.tables.assocs_where("acct"))
            .bind(account.as_str())
            .fetch_all(&self.pool)
            .await
            .wrap_err_with(|| format!("listing associations of account {account}"))?;
        Ok(rows.into_iter().map(Assoc::from).collect())
    }

    #[instrument(skip(self))]
    async fn assocs_for_user(&self, user: &SlurmUser) -> Result<Vec<Assoc>> {
        let rows: Vec<AssocRow> = sqlx::query_as(&self.tables.assocs_where("user"))
            .bind(user.as_str())
            .fetch_all(&self.pool)
            .await
            .wrap_err_with(|| format!("listing associations of user {user}"))?;
        Ok(rows.into_iter().map(Assoc::from).collect())
    }

    #[instrument(skip(self, assoc_ids), fields(assocs = assoc_ids.len()))]
    async fn count_jobs(&self, assoc_ids: &[u32]) -> Result<u64> {
        if assoc_ids.is_empty() {
            return Ok(0);
        }
        let count: i64 = self
            .tables
            .jobs_in("COUNT(*)", assoc_ids)
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .wrap_err("counting jobs")?;
        Ok(u64::try_from(count)?)
    }

    #[instrument(skip(self, assoc_ids), fields(assocs = assoc_ids.len()))]
    async fn jobs(&self, assoc_ids: &[u32], offset: u64, limit: u64) -> Result<Vec<JobRecord>> {
        if assoc_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = self.tables.jobs_in(JOB_COLUMNS, assoc_ids);
        query.push(" ORDER BY j.time_submit DESC, j.job_db_inx DESC LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(offset);
        let rows: Vec<JobRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .wrap_err_with(|| format!("listing jobs {offset}..{}", offset.saturating_add(limit)))?;
        Ok(rows.into_iter().map(|row| row.into_record(self.gpu_tres_id)).collect())
    }

    #[instrument(skip(self, assoc_ids), fields(assocs = assoc_ids.len()))]
    async fn job(&self, assoc_ids: &[u32], id_job: u32) -> Result<Option<JobRecord>> {
        if assoc_ids.is_empty() {
            return Ok(None);
        }
        let mut query = self.tables.jobs_in(JOB_COLUMNS, assoc_ids);
        query.push(" AND j.id_job = ");
        query.push_bind(id_job);
        query.push(" ORDER BY j.time_submit DESC LIMIT 1");
        let row: Option<JobRow> = query
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("looking up job {id_job}"))?;
        Ok(row.map(|row| row.into_record(self.gpu_tres_id)))
    }
}
