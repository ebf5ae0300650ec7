mod app;
mod cli;

use clap::Parser;
use cli::Cli;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // A broken config must never serve traffic; bail before anything else.
    let mut config = causeway_core::config::Config::load(&cli.config)?;

    // CLI overrides
    if let Some(ref host) = cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let _guard = causeway_core::logging::init_logging(
        &cli.log_level,
        config.logging_to_file,
        config.log_dir.as_deref(),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let application = app::Application::build(config, cli.config.clone())?;
        application.serve().await
    })
}
