//! factd: fact store sidecar.
//!
//! Listens on loopback for the authoritative peer and serves named graphs.
//! Logging follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use factd_sidecar::registry::RegistryConfig;
use factd_sidecar::server::{ServerConfig, SidecarServer};
use factd_sidecar::storage::CacheConfig;
use factd_sidecar::transport::TransportConfig;

#[derive(Parser, Debug)]
#[command(name = "factd", version, about = "Fact store sidecar")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "FACTD_LISTEN", default_value = "127.0.0.1:9090")]
    listen: String,
    /// Directory for graphs opened with a relative path
    #[arg(long, env = "FACTD_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Page cache budget per graph, in bytes
    #[arg(long, env = "FACTD_CACHE_BYTES", default_value_t = 64 * 1024 * 1024)]
    cache_bytes: usize,
    /// Page cache budget per graph, in pages
    #[arg(long, env = "FACTD_CACHE_PAGES", default_value_t = 8192)]
    cache_pages: usize,
    /// Push events buffered per connection
    #[arg(long, env = "FACTD_EVENT_CAPACITY", default_value_t = 256)]
    event_capacity: usize,
    /// Per-request timeout for requests the sidecar issues, in seconds
    #[arg(long, env = "FACTD_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
    /// Async worker threads (default: one per core)
    #[arg(long, env = "FACTD_WORKER_THREADS")]
    worker_threads: Option<usize>,
    /// Blocking pool size for store work
    #[arg(long, env = "FACTD_BLOCKING_THREADS", default_value_t = 64)]
    blocking_threads: usize,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.listen.clone(),
            event_capacity: self.event_capacity,
            transport: TransportConfig {
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                ..TransportConfig::default()
            },
            registry: RegistryConfig {
                default_cache: CacheConfig {
                    max_bytes: self.cache_bytes,
                    max_pages: self.cache_pages,
                },
                data_dir: self.data_dir.clone(),
            },
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .enable_all()
        .thread_name("factd")
        .max_blocking_threads(cli.blocking_threads.max(1));
    if let Some(n) = cli.worker_threads {
        builder.worker_threads(n.max(1));
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("factd exited: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> factd_sidecar::SidecarResult<()> {
    info!("Starting factd {}", env!("CARGO_PKG_VERSION"));
    let server = SidecarServer::new(cli.server_config());
    let listener = server.bind().await?;

    let serving = server.clone();
    let serve = tokio::spawn(async move { serving.serve(listener).await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received"),
        Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
    }
    server.shutdown().await;
    serve.await??;
    info!("factd stopped");
    Ok(())
}
