use clap::Parser;

use tunnelhub::app;
use tunnelhub::config::{Config, ConfigFile};

const DEFAULT_CONFIG: &str = "tunnelhub.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_file_path =
        std::env::var("TUNNELHUB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = std::path::Path::new(&config_file_path);
    if config_path.exists() {
        match ConfigFile::load(config_path) {
            Ok(file_cfg) => file_cfg.inject_env(),
            Err(e) => eprintln!("warning: failed to load {config_file_path}: {e}"),
        }
    }

    let config = Config::parse();
    app::run(config).await
}
