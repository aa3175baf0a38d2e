use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use datagate_core::{
    auth::UserDirectory,
    codec::JsonCodec,
    listener::ListenerBuilder,
    orchestrator::{IoManager, WorkerPool},
    session::SessionRegistry,
};
use datagate_services::{
    dispatch::Dispatcher,
    logon::{LogonService, ProductInfo, LOGON_SERVICE},
    registry::ServiceRegistry,
};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::{
    config::Config,
    factory::connection_factory,
    services::{admin_service, data_service, ADMIN_SERVICE, DATA_SERVICE},
};

mod config;
mod factory;
mod services;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).await?;
    info!("config loaded from {}", args.config);

    // Collaborators shared by every I/O thread
    let users = Arc::new(UserDirectory::new(config.users.iter().cloned()));
    let sessions = Arc::new(SessionRegistry::new(config.session.idle_timeout()));
    let pool = WorkerPool::start(&config.runtime, config.pool)?;
    let product = ProductInfo {
        name: config.session.product_name.clone(),
        version: config.session.product_version.clone(),
    };

    let logon = LogonService::new(sessions.clone(), users.clone(), product.clone());
    let (admin, admin_roles) = admin_service(sessions.clone(), product)?;
    let registry = ServiceRegistry::builder(users)
        .register_anonymous(LOGON_SERVICE, logon.into_methods()?)?
        .register(DATA_SERVICE, data_service()?, None)?
        .register(ADMIN_SERVICE, admin, Some(admin_roles))?
        .build();
    info!("{} services registered", registry.len());

    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        sessions.clone(),
        pool.handle(),
        Arc::new(JsonCodec),
    );
    let factory = connection_factory(config.server_config(), dispatcher);
    let listener_factory = ListenerBuilder::try_from(config.transport.listener.clone())?;

    // Start I/O threads
    let manager = IoManager::new(config.runtime.clone());
    let io_threads = manager.spawn(Arc::new(listener_factory), Arc::new(factory))?;
    info!(
        "{} io threads serving {:?}",
        io_threads.len(),
        config.transport.listener
    );

    // Reap idle sessions until every I/O thread is gone
    let reap_interval = config.session.reap_interval();
    while !io_threads.iter().all(|t| t.join.is_finished()) {
        monoio::time::sleep(reap_interval).await;
        let expired = sessions.expire_idle();
        if !expired.is_empty() {
            info!("{} idle session(s) expired", expired.len());
        }
    }

    for thread in io_threads {
        if thread.join.join().is_err() {
            error!("io thread panicked");
        }
    }
    pool.shutdown();
    Ok(())
}
