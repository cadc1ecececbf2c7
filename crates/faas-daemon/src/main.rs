use anyhow::Result;

use faas_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("faas-daemon")?;
    faas_daemon::server::run().await
}
