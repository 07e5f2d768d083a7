//! ORB demo server — entry point.
//!
//! ```text
//! orb-server                   Serve with the default config
//! orb-server --config <path>   Load a custom config TOML
//! orb-server --gen-config      Write default config to stdout
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use orb_core::connection::serve;
use orb_core::{
    ObjectAdapter, OperationMode, OperationTable, OutputStream, Servant,
};

use config::ServerConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "orb-server", about = "ORB demo object server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "orb-server.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Greeter servant ──────────────────────────────────────────────

struct Greeter {
    table: OperationTable,
}

impl Greeter {
    fn new() -> Self {
        let started = Instant::now();
        let table = OperationTable::new()
            .add("greet", OperationMode::Normal, |_, is, responder| {
                is.start_encapsulation()?;
                let name = is.read_string()?;
                is.end_encapsulation()?;
                let mut os = OutputStream::new();
                os.start_encapsulation();
                os.write_string(&format!("Hello, {name}!"));
                os.end_encapsulation()?;
                responder.complete(os.finished());
                Ok(())
            })
            .add("ping", OperationMode::Nonmutating, |_, is, responder| {
                is.skip_encapsulation()?;
                responder.complete(empty_encaps());
                Ok(())
            })
            .add(
                "uptime",
                OperationMode::Idempotent,
                move |_, is, responder| {
                    is.skip_encapsulation()?;
                    let mut os = OutputStream::new();
                    os.start_encapsulation();
                    os.write_i64(started.elapsed().as_secs() as i64);
                    os.end_encapsulation()?;
                    responder.complete(os.finished());
                    Ok(())
                },
            );
        Greeter { table }
    }
}

impl Servant for Greeter {
    fn operations(&self) -> &OperationTable {
        &self.table
    }
}

fn empty_encaps() -> Bytes {
    let mut os = OutputStream::new();
    os.write_empty_encapsulation();
    os.finished()
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = ServerConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("orb-server v{}", env!("CARGO_PKG_VERSION"));
    info!("bind: {}:{}", config.network.host, config.network.port);

    let adapter = Arc::new(ObjectAdapter::new("demo"));
    adapter.add("demo/greeter".parse()?, Arc::new(Greeter::new()))?;

    let listener =
        TcpListener::bind((config.network.host.as_str(), config.network.port)).await?;

    tokio::select! {
        result = serve(listener, adapter) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    Ok(())
}
