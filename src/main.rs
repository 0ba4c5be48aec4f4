/// flowrelay worker
///
/// Main entry point. Loads configuration from `FLOWRELAY_*` environment
/// variables and runs an execution worker until interrupted.

use flowrelay::{config::Config, server::start_worker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_worker(config).await?;

    Ok(())
}
