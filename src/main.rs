use std::{process::ExitCode, sync::Arc};

use audit::{AuditLog, FileAuditLog, MemoryAuditLog};
use config::ProvisionerConfig;
use firewall::{Disabled, Firewall, Iptables};
use orchestrator::Orchestrator;
use ports::{BindingPlanner, OsPortProbe, PortAllocator, Protocol};
use records::InMemoryRecords;
use runtime::{ContainerRuntime, docker::DockerRuntime};

mod api;
mod audit;
mod cli;
mod config;
mod error;
mod firewall;
mod image;
mod orchestrator;
mod ports;
mod records;
mod runtime;
mod signals;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine
    let _ = dotenv::dotenv();

    // Initialize the logger
    env_logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::get_cli_args();
    let config = ProvisionerConfig::try_init(&args.config).await?;
    let listen = match args.listen {
        Some(addr) => addr,
        None => config.listen_addr()?,
    };

    let stop_timeout = i32::try_from(config.runtime.stop_timeout_secs).unwrap_or(i32::MAX);
    let docker = DockerRuntime::connect(stop_timeout)?;
    if let Err(e) = docker.ping().await {
        log::warn!("Docker daemon is not reachable yet: {e}");
    }
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let firewall: Arc<dyn Firewall> = if config.firewall.enabled {
        Arc::new(Iptables::default())
    } else {
        log::info!("Firewall management is disabled");
        Arc::new(Disabled)
    };
    if config.firewall.enabled && config.firewall.open_listen_port {
        if let Err(e) = firewall.allow(listen.port(), Protocol::Tcp).await {
            log::warn!("Unable to open listen port {} in the firewall: {e}", listen.port());
        }
    }

    let audit: Arc<dyn AuditLog> = match &config.audit.path {
        Some(path) => Arc::new(FileAuditLog::open(path).await?),
        None => Arc::new(MemoryAuditLog::new()),
    };

    let allocator = Arc::new(PortAllocator::new(
        OsPortProbe,
        config.ports.host_ip,
        config.ports.reservation_ttl(),
    ));
    let orchestrator = Orchestrator::new(
        runtime,
        BindingPlanner::new(allocator),
        config.runtime.timeouts(),
    )
    .with_firewall(firewall)
    .with_audit(audit)
    .with_records(Arc::new(InMemoryRecords::new()));

    let state = Arc::new(api::ApiState {
        orchestrator,
        audit_limit: config.audit.recent_limit,
    });

    let shutdown = signals::shutdown_on_signal()?;
    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {listen}");
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(signals::wait_for_shutdown(shutdown))
        .await?;

    log::info!("Server stopped");
    Ok(())
}
