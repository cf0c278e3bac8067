mod dnsforward;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "dnsforward", version, about = "Forwarding proxy for DNS messages")]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses PROXY_CONFIG; then
    /// auto-detects dnsproxy.toml > dnsproxy.yaml > dnsproxy.yml from CWD; then falls back
    /// to the OS default config path.
    #[arg(long, env = "PROXY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Override the admin HTTP address (`/health`, `/metrics`) from the config file.
    #[arg(long)]
    admin_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dnsforward::run(cli.config, cli.admin_addr).await
}
