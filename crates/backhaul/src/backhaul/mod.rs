pub mod app;
pub mod backoff;
pub mod client;
pub mod config;
pub mod logging;
pub mod net;
pub mod server;
pub mod stream;
pub mod telemetry;

#[cfg(test)]
mod e2e_tests;

pub async fn run(config_path: Option<std::path::PathBuf>, mode: app::Mode) -> anyhow::Result<()> {
    app::run(config_path, mode).await
}
