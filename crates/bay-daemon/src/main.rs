mod server;
mod telemetry;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init("bay-daemon")?;
    server::run().await
}
