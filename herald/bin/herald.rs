//! The herald daemon.

use clap::Parser;

#[derive(Parser)]
#[command(name = "herald", version, about = "Campaign injection control plane")]
struct Args {
    /// Data directory (overrides HERALD_DATA_DIR).
    #[arg(long)]
    data_dir: Option<String>,

    /// Control socket path (overrides HERALD_CONTROL_SOCKET).
    #[arg(long)]
    socket: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if let Some(data_dir) = args.data_dir {
        std::env::set_var("HERALD_DATA_DIR", data_dir);
    }
    if let Some(socket) = args.socket {
        std::env::set_var("HERALD_CONTROL_SOCKET", socket);
    }

    herald_common::logging::init();

    let daemon = herald::Herald::build().await?;
    daemon.run().await
}
