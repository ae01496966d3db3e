use clap::Parser;

use zephyr_mcp_runtime::{McpCommands, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "zephyr-mcp",
    version,
    about = "Zephyr Scale MCP server over stdio"
)]
struct Cli {
    /// Base URL of the Zephyr Scale instance
    #[arg(
        long,
        env = "ZEPHYR_BASE_URL",
        default_value = "http://localhost:8080"
    )]
    base_url: String,

    /// Skip credential check (for use behind an auth-injecting proxy)
    #[arg(long, env = "ZEPHYR_NO_AUTH")]
    no_auth: bool,

    #[command(subcommand)]
    command: McpCommands,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let code = run_mcp(&cli.base_url, cli.no_auth, cli.command).await;
    std::process::exit(code);
}
