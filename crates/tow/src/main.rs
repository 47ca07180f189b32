mod tow;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tow",
    version,
    about = "tow - multiplex TCP connections over a reconnectable WebSocket"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses TOW_CONFIG; then auto-detects tow.toml > tow.yaml > tow.yml from CWD; then falls back to the OS default path (Linux: /etc/tow/tow.toml; others: user config dir).
    #[arg(long, env = "TOW_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Host to listen on; overrides the host part of listen_addr.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Port to listen on; overrides the port part of listen_addr.
    #[arg(short, long, env = "PORT")]
    port: Option<String>,

    /// Log at debug level regardless of config and RUST_LOG.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tow::run(tow::app::RunOptions {
        config_path: cli.config,
        host: cli.host,
        port: cli.port,
        verbose: cli.verbose,
    })
    .await
}
