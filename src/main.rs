use clap::Parser;
use ssc_hub::config::HubConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubConfig::parse();
    ssc_hub::logger::init(&config.log_level)?;
    ssc_hub::run(config).await
}
