use easy_error::Terminator;
use tracing::info;

use ssrelay_rs::{RelayServer, cli};

#[tokio::main]
async fn main() -> Result<(), Terminator> {
    let args = cli::parse_args()?;
    let server = RelayServer::from_config_file(&args.config_file).await?;
    if args.config_test {
        info!("config file {} is ok", args.config_file);
        return Ok(());
    }
    server.run().await?;
    Ok(())
}
