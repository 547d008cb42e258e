use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use poem::{listener::TcpListener, Server};
use portal_api::{
    allocations::FileAllocations,
    auth::StaffList,
    cli::Args,
    config::Settings,
    portal::{Portal, PortalOptions},
    prometheus::Prometheus,
    routes,
    slurmdb::SlurmDb,
};
use tracing::info;

/// `worker_threads`: only workers for async tasks (tokio::spawn, main). spawn_blocking spawns extra threads
#[tokio::main(worker_threads = 4)]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    tracing_subscriber::fmt::fmt().with_max_level(args.log_level).init();

    let settings = Settings::new(args.config.as_deref()).wrap_err("loading settings")?;
    let allocations = FileAllocations::load(Path::new(&settings.allocations_file)).await?;
    let portal = Portal::new(
        Arc::new(Prometheus::new(&settings.prometheus)?),
        Arc::new(SlurmDb::connect_lazy(&settings.database)?),
        Arc::new(allocations),
        PortalOptions::from(&settings),
    );
    let staff: StaffList = settings.staff.iter().map(String::as_str).collect();

    let app = routes::app(portal, staff, &format!("http://{}", settings.listen));
    info!(listen = %settings.listen, "serving");
    Server::new(TcpListener::bind(settings.listen.clone())).run(app).await?;
    Ok(())
}
