#![forbid(unsafe_code)]

use std::fs;
use std::sync::atomic::{self, AtomicU16, AtomicUsize};
use std::sync::Arc;
use tokio::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

use web3_gateway::app::Web3GatewayApp;
use web3_gateway::config::{CliConfig, TopConfig};
use web3_gateway::{flatten_handle, flatten_handles, frontend};

fn main() -> anyhow::Result<()> {
    // if RUST_LOG isn't set, configure a default
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,web3_gateway=debug");
    }

    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .init();

    fdlimit::raise_fd_limit();

    let cli_config: CliConfig = argh::from_env();

    info!("loading config @ {}", cli_config.config);
    let top_config: String = fs::read_to_string(cli_config.config.clone())?;

    let top_config: TopConfig = toml::from_str(&top_config)?;

    proctitle::set_title("web3_gateway");

    let mut rt_builder = runtime::Builder::new_multi_thread();

    rt_builder.enable_all().thread_name_fn(move || {
        static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
        let worker_id = ATOMIC_ID.fetch_add(1, atomic::Ordering::SeqCst);
        format!("gateway-{}", worker_id)
    });

    if cli_config.workers > 0 {
        rt_builder.worker_threads(cli_config.workers);
    }

    let rt = rt_builder.build()?;

    // spawn a thread for deadlock detection
    #[cfg(feature = "deadlock_detection")]
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_secs(10));
        let deadlocks = parking_lot::deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }

        eprintln!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            eprintln!("Deadlock #{}", i);
            for t in threads {
                eprintln!("Thread Id {:#?}", t.thread_id());
                eprintln!("{:#?}", t.backtrace());
            }
        }
    });

    // spawn the root task
    rt.block_on(async {
        let (app, app_handles) = Web3GatewayApp::spawn(top_config).await?;

        let bound_port = Arc::new(AtomicU16::new(0));

        let frontend_handle =
            tokio::spawn(frontend::serve(cli_config.port, app, bound_port));

        // if everything is working, these should both run forever
        tokio::select! {
            x = flatten_handles(app_handles) => {
                info!(?x, "app handles exited");
            }
            x = flatten_handle(frontend_handle) => {
                info!(?x, "frontend exited");
            }
        };

        Ok(())
    })
}
