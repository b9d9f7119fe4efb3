use anyhow::Result;

use postbox_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("postbox-daemon")?;
    postbox_daemon::server::run().await
}
