use anyhow::{Error, Result};
use notification_dispatch::{config::Config, runtime, telemetry};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    config.validate()?;

    telemetry::init(config.log_format);

    let _ = rustls::crypto::ring::default_provider().install_default();

    runtime::run(config).await
}
