//! ORB demo client — entry point.
//!
//! ```text
//! orb-client --name Alice                   Greet via the default server
//! orb-client --host 10.0.0.7 --port 4062    Pick the server address
//! orb-client --uptime                       Query server uptime instead
//! ```

use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use orb_core::{Connection, InputStream, OperationMode, OutputStream, Proxy};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "orb-client", about = "ORB demo client")]
struct Cli {
    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(long, default_value_t = 4062)]
    port: u16,

    /// Object identity to invoke on.
    #[arg(long, default_value = "demo/greeter")]
    identity: String,

    /// Name to greet.
    #[arg(short, long, default_value = "world")]
    name: String,

    /// Query server uptime instead of greeting.
    #[arg(long)]
    uptime: bool,

    /// Invocation timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("connecting to {}:{}", cli.host, cli.port);
    let connection = Connection::connect(&cli.host, cli.port).await?;
    let proxy = Proxy::new(connection.clone(), cli.identity.parse()?)
        .with_timeout(Duration::from_millis(cli.timeout_ms));

    proxy.ping().await?;
    info!("server reachable");

    if cli.uptime {
        let mut os = OutputStream::new();
        os.write_empty_encapsulation();
        let reply = proxy
            .invoke("uptime", OperationMode::Idempotent, os.finished())
            .await?;
        let mut is = InputStream::new(&reply);
        is.start_encapsulation()?;
        let seconds = is.read_i64()?;
        is.end_encapsulation()?;
        println!("server uptime: {seconds}s");
    } else {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_string(&cli.name);
        os.end_encapsulation()?;
        let reply = proxy
            .invoke("greet", OperationMode::Normal, os.finished())
            .await?;
        let mut is = InputStream::new(&reply);
        is.start_encapsulation()?;
        let greeting = is.read_string()?;
        is.end_encapsulation()?;
        println!("{greeting}");
    }

    connection.close().await?;
    Ok(())
}
