//! Host binary entry point
//!
//! Loads the TOML configuration (writing a default file when missing),
//! layers `PLAYHOST_*` environment overrides and CLI flags on top, installs
//! logging, then opens every persisted project and serves the HTTP surface
//! until SIGINT/SIGTERM.

mod cli;
mod signals;

use anyhow::{Context, Result};
use game_host::logging::setup_logging;
use game_host::{Host, HostConfig};
use plugin_runtime::host_version;
use tracing::info;

use cli::CliArgs;

fn display_banner() {
    println!(
        r#"
    ____  __            __               __
   / __ \/ /___ ___  __/ /_  ____  _____/ /_
  / /_/ / / __ `/ / / / __ \/ __ \/ ___/ __/
 / ____/ / /_/ / /_/ / / / / /_/ (__  ) /_
/_/   /_/\__,_/\__, /_/ /_/\____/____/\__/
              /____/        v{}
"#,
        host_version()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Configuration first, logging depends on it.
    let mut config = HostConfig::load_from_file(&args.config_path)
        .await
        .with_context(|| format!("loading {}", args.config_path.display()))?;
    config.apply_env();
    args.apply(&mut config);
    config.validate().context("configuration validation failed")?;

    setup_logging(&config.logging, args.json_logs)?;
    display_banner();

    info!("🚀 Playhost v{}", host_version());
    info!("📋 Configuration Summary:");
    info!("  📂 Config file: {}", args.config_path.display());
    info!("  🌐 Bind address: {}", config.server.bind_address);
    info!("  🗄️ Data directory: {}", config.storage.data_dir.display());
    info!("  🔧 Environment: {}", config.server.node_env);

    let host = Host::build(config, builtin_plugins::catalog()).await?;
    host.start().await?;
    host.serve(signals::shutdown_signal()).await?;

    info!("👋 Playhost shut down cleanly");
    Ok(())
}
