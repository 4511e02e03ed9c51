use clap::Parser;
use cosmos_web::{config::DEFAULT_CONF_DIR, logging, Config, Service, StartupError, TcpReactor};
use std::{io, path::PathBuf, sync::Arc};
use tokio::task::JoinSet;

/// Static file server and FastCGI gateway.
#[derive(Debug, Parser)]
#[command(name = "cosmos", version, about)]
struct Args {
    /// Directory holding one JSON document per server.
    #[arg(long, default_value = DEFAULT_CONF_DIR)]
    conf_dir: PathBuf,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), StartupError> {
    let args = Args::parse();
    let configs = Config::load_dir(&args.conf_dir)?;

    if let Some(first) = configs.first() {
        logging::init(&args.log_level, &first.error_log, &first.access_log)?;
    }

    let threads = configs.iter().map(Config::threads).max().unwrap_or(1);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?
        .block_on(serve(configs))
}

async fn serve(configs: Vec<Config>) -> Result<(), StartupError> {
    let mut reactors = Vec::with_capacity(configs.len());
    let mut servers = JoinSet::new();

    for config in &configs {
        let reactor = Arc::new(TcpReactor::new(&config.service_limits()));
        let service = Arc::new(Service::new(config, reactor.clone())?);

        reactors.push(reactor);
        servers.spawn(service.launch());
    }

    tracing::info!(servers = configs.len(), "started");

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
        Some(joined) = servers.join_next() => match joined {
            Ok(result) => result,
            Err(err) => Err(StartupError::Runtime(io::Error::other(err))),
        },
    };

    for reactor in &reactors {
        reactor.stop();
    }
    while servers.join_next().await.is_some() {}

    result
}
