use cadence_infra::CadenceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cadence_observability::init();

    let config = CadenceConfig::from_env()?;
    if config.lock_timeout.is_none() {
        tracing::warn!("CADENCE_LOCK_TIMEOUT_SECS not set; entries held by a crashed worker stay locked");
    }

    cadence_worker::run(config).await
}
