use std::fmt::Display;

use chrono::Utc;
use poem::{http::StatusCode, Endpoint, EndpointExt as _, Route};
use poem_openapi::{
    param::{Path, Query},
    payload::{Html, Json},
    ApiResponse, OpenApi, OpenApiService,
};
use portal_data::{
    account::{SlurmAccount, SlurmUser},
    graph::{AccountGraph, JobGraph, UserGraph},
};
use serde::Serialize;
use tracing::{debug, error};

use crate::{
    auth::{RemoteUser, StaffList},
    error::PortalError,
    html,
    portal::Portal,
};

pub struct PortalApi {
    portal: Portal,
}

#[derive(ApiResponse)]
enum JobsIndex {
    /// The requester's own job page.
    #[oai(status = 302)]
    Own(#[oai(header = "Location")] String),
}

fn parse_graph<G: std::str::FromStr>(name: &str) -> Result<G, PortalError> {
    name.parse().map_err(|_| PortalError::not_found(format!("graph {name}")))
}

#[OpenApi]
impl PortalApi {
    fn err_into_500(error: impl Display) -> poem::Error {
        error!("Error generated during API call: {error:#}");
        poem::Error::from_string(format!("{error:#}"), StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn return_json<T: Serialize>(data: Result<T, PortalError>) -> Result<Json<serde_json::Value>, poem::Error> {
        let json = serde_json::to_value(&data?).map_err(Self::err_into_500)?;
        Ok(Json(json))
    }

    /// Accounts of the requester, with their allocations.
    #[oai(path = "/accountstats", method = "get")]
    async fn index(&self, auth: RemoteUser) -> Result<Html<String>, poem::Error> {
        let accounts = self.portal.accounts_of(&auth.0).await?;
        Ok(Html(html::index_page(&auth.0.user, &accounts).into_string()))
    }

    /// Allocation, graphs and submitted jobs of an account, newest first, 100 per page.
    ///
    /// `page` out of range is clamped to the first/last page.
    #[oai(path = "/accountstats/:account", method = "get")]
    async fn account(&self, auth: RemoteUser, account: Path<String>, page: Query<Option<String>>) -> Result<Html<String>, poem::Error> {
        let summary = self
            .portal
            .account_summary(&auth.0, &SlurmAccount(account.0), page.0.as_deref())
            .await?;
        Ok(Html(html::account_page(&summary).into_string()))
    }

    /// Same as the account page, as JSON: `{account, gpu?, cpu_count?, gpu_count?, jobs: {...}}`.
    #[oai(path = "/accountstats/:account/summary.json", method = "get")]
    async fn account_summary(
        &self,
        auth: RemoteUser,
        account: Path<String>,
        page: Query<Option<String>>,
    ) -> Result<Json<serde_json::Value>, poem::Error> {
        Self::return_json(
            self.portal
                .account_summary(&auth.0, &SlurmAccount(account.0), page.0.as_deref())
                .await,
        )
    }

    /// Chart of an account: `{lines: [{x, y, type, name, stackgroup?, yaxis?}], layout}`.
    ///
    /// `graph` is one of `cpu_{allocated,used,wasted}`, `mem_*`, `gpu_*`, `gpu_power_*`,
    /// `lustre_mdt`, `lustre_ost`, `cpu_priority`, `gpu_priority`, with or without `.json`.
    #[oai(path = "/accountstats/:account/graph/:graph", method = "get")]
    async fn account_graph(
        &self,
        auth: RemoteUser,
        account: Path<String>,
        graph: Path<String>,
    ) -> Result<Json<serde_json::Value>, poem::Error> {
        let graph: AccountGraph = parse_graph(&graph.0)?;
        Self::return_json(
            self.portal
                .account_graph(&auth.0, &SlurmAccount(account.0), graph, Utc::now())
                .await,
        )
    }

    /// Sends everyone to their own job list.
    #[oai(path = "/jobstats", method = "get")]
    async fn jobs_index(&self, auth: RemoteUser) -> JobsIndex {
        JobsIndex::Own(format!("/jobstats/{}", auth.0.user))
    }

    /// Jobs of a user over all their accounts, newest first.
    #[oai(path = "/jobstats/:username", method = "get")]
    async fn user(&self, auth: RemoteUser, username: Path<String>, page: Query<Option<String>>) -> Result<Html<String>, poem::Error> {
        let user = SlurmUser(username.0);
        let jobs = self.portal.user_jobs(&auth.0, &user, page.0.as_deref()).await?;
        Ok(Html(html::user_page(&user, &jobs).into_string()))
    }

    /// Chart over the last 6 hours of all jobs of a user, one line per job.
    ///
    /// `graph`: `cpu`, `mem`, `lustre_mdt`, `lustre_ost`, `gpu_utilization`, `gpu_power`.
    #[oai(path = "/jobstats/:username/graph/:graph", method = "get")]
    async fn user_graph(
        &self,
        auth: RemoteUser,
        username: Path<String>,
        graph: Path<String>,
    ) -> Result<Json<serde_json::Value>, poem::Error> {
        let graph: UserGraph = parse_graph(&graph.0)?;
        Self::return_json(
            self.portal
                .user_graph(&auth.0, &SlurmUser(username.0), graph, Utc::now())
                .await,
        )
    }

    /// Details of one job with links to its graphs.
    #[oai(path = "/jobstats/:username/:job_id", method = "get")]
    async fn job(&self, auth: RemoteUser, username: Path<String>, job_id: Path<u32>) -> Result<Html<String>, poem::Error> {
        let job = self.portal.job(&auth.0, &SlurmUser(username.0), job_id.0).await?;
        Ok(Html(html::job_page(&job).into_string()))
    }

    /// Core and GPU hours of one job so far, and what they cost:
    /// `{elapsed_hours, core_hours, gpu_hours, cpu_cost, gpu_cost, total}`.
    #[oai(path = "/jobstats/:username/:job_id/value/cost.json", method = "get")]
    async fn job_cost(&self, auth: RemoteUser, username: Path<String>, job_id: Path<u32>) -> Result<Json<serde_json::Value>, poem::Error> {
        Self::return_json(
            self.portal
                .job_cost(&auth.0, &SlurmUser(username.0), job_id.0, Utc::now())
                .await,
        )
    }

    /// Chart of one job over its runtime.
    ///
    /// `graph`: `cpu`, `mem`, `lustre_mdt`, `lustre_ost`, `gpu_utilization`,
    /// `gpu_memory_utilization`, `gpu_memory`, `gpu_power`, `gpu_pcie`, `gpu_nvlink`,
    /// `infiniband_bdw`, `disk_iops`, `disk_bdw`, `disk_used`, `power`.
    #[oai(path = "/jobstats/:username/:job_id/graph/:graph", method = "get")]
    async fn job_graph(
        &self,
        auth: RemoteUser,
        username: Path<String>,
        job_id: Path<u32>,
        graph: Path<String>,
    ) -> Result<Json<serde_json::Value>, poem::Error> {
        let graph: JobGraph = parse_graph(&graph.0)?;
        Self::return_json(
            self.portal
                .job_graph(&auth.0, &SlurmUser(username.0), job_id.0, graph, Utc::now())
                .await,
        )
    }
}

/// The whole route tree: API, Swagger UI under `/docs`, request logging.
pub fn app(portal: Portal, staff: StaffList, server_url: &str) -> impl Endpoint {
    let api_service =
        OpenApiService::new(PortalApi { portal }, "Cluster usage portal", env!("CARGO_PKG_VERSION")).server(server_url);
    let ui = api_service.swagger_ui();
    Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .data(staff)
        .around(|route, request| async move {
            // request logging middleware
            debug!(?request, "received request");
            let response = route.call(request).await;
            if let Err(error) = &response {
                debug!(status = %error.status(), "request failed");
            }
            response
        })
}
