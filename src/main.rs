mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;
use std::time::Duration;

use fidelio::runtime::LocalRuntime;
use fidelio::store::{CoordinationStore, MemoryStore};
use fidelio::{
    Broker, BrokerSpec, ContainerType, Error as FidelioError, Master, ProgramConfig, SchemaParser,
    StoreLayout,
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(fidelio_error) = e.downcast_ref::<FidelioError>() {
            eprintln!("Error: {}", fidelio_error);
            if let Some(suggestion) = fidelio_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    init_tracing()?;

    let cli = Cli::parse();

    let mut config = ProgramConfig::from_env();
    if let Some(hosts) = &cli.hosts {
        config.hosts = hosts.clone();
    }
    if let Some(secs) = cli.session_timeout {
        config.session_timeout = Duration::from_secs(secs);
    }
    let layout = StoreLayout::new(cli.root.clone());

    // The broker reads its descriptor from the store, not the schema file.
    if let Commands::Broker {
        service,
        tier,
        container_path,
        conf_path,
    } = &cli.command
    {
        return run_broker(
            config,
            layout,
            service.clone(),
            tier,
            container_path.clone(),
            conf_path.clone(),
        )
        .await;
    }

    let schema = SchemaParser::new().load(&cli.schema)?;

    if matches!(cli.command, Commands::Validate) {
        let master = Master::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalRuntime::new(
                Arc::new(MemoryStore::new()),
                config.clone(),
            )),
            config,
            layout,
            schema,
        )?;
        println!(
            "Schema OK: {} containers, no cycles, no duplicates",
            master.containers().len()
        );
        return Ok(());
    }

    let store = open_store(&config)?;
    if config.hosts == "local" && !matches!(cli.command, Commands::Start) {
        tracing::warn!(
            "The in-process store is scoped to this process; this command only sees state created here"
        );
    }
    let runtime = Arc::new(LocalRuntime::new(Arc::clone(&store), config.clone()));
    let master = Master::new(
        store,
        Arc::clone(&runtime) as Arc<dyn fidelio::runtime::ContainerRuntime>,
        config,
        layout,
        schema,
    )?;

    match cli.command {
        Commands::Start => {
            master.start().await?;
            tracing::info!("Application launched; waiting for shutdown (Ctrl-C to stop)");

            let mut waiter = tokio::spawn({
                let runtime = Arc::clone(&runtime);
                async move { runtime.join_all().await }
            });
            let results = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupt received; signaling shutdown");
                    master.stop().await?;
                    (&mut waiter).await?
                }
                results = &mut waiter => results?,
            };

            let mut failed = false;
            for (service, result) in results {
                match result {
                    Ok(()) => tracing::info!("Broker '{}' shut down cleanly", service),
                    Err(e) => {
                        failed = true;
                        tracing::error!("Broker '{}' failed: {}", service, e);
                    }
                }
            }
            if failed {
                std::process::exit(-1);
            }
        }
        Commands::Stop => {
            master.stop().await?;
            println!("Shutdown signaled");
        }
        Commands::Restart { drain_timeout } => {
            master.restart(Duration::from_secs(drain_timeout)).await?;
            println!("Application relaunched");
        }
        Commands::Status => {
            for (service, status) in master.status().await? {
                match status {
                    Some(status) => println!("{:<24} {}", service, status),
                    None => println!("{:<24} not registered", service),
                }
            }
        }
        // These are handled earlier
        Commands::Validate | Commands::Broker { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Runs one broker to completion against the given store coordinates.
/// Exits 0 on clean shutdown and -1 on unrecoverable failure.
async fn run_broker(
    config: ProgramConfig,
    layout: StoreLayout,
    service: String,
    tier: &str,
    container_path: Option<String>,
    conf_path: Option<String>,
) -> anyhow::Result<()> {
    let container_type = match tier {
        "web" => ContainerType::Web,
        "business" => ContainerType::Business,
        "data" => ContainerType::Data,
        other => {
            eprintln!("Invalid tier: '{}'. Use 'web', 'business' or 'data'.", other);
            std::process::exit(1);
        }
    };

    let store = open_store(&config)?;
    if config.hosts == "local" {
        tracing::warn!(
            "The in-process store is scoped to this process; a standalone broker only sees state created here"
        );
    }

    let spec = BrokerSpec {
        container_path: container_path
            .unwrap_or_else(|| layout.container_path(container_type, &service)),
        conf_path: conf_path.unwrap_or_else(|| layout.conf_path(&service)),
        naming_root: layout.naming_root(),
        shutdown_path: layout.shutdown_path(),
        service_name: service.clone(),
    };
    match Broker::new(store, config, spec).run().await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("FAILED to run broker for '{}': {}", service, e);
            std::process::exit(-1);
        }
    }
}

fn open_store(config: &ProgramConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    if config.hosts == "local" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Err(FidelioError::Config(format!(
            "no client for coordination-store hosts '{}'; only the in-process store (\"local\") is built in",
            config.hosts
        ))
        .into())
    }
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
