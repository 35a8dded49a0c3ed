use pult_lib::config::{config_path, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()
        .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {e}", config_path().display()))?;

    pult_lib::run(config).await?;
    Ok(())
}
