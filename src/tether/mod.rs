pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod offline;
pub mod protocol;
pub mod status;
pub mod telemetry;
pub mod tunnel;
pub mod voice;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
