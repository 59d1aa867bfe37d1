use aishell::config::Config;
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aishell=info")),
        )
        .init();

    let matches = Command::new("aishelld")
        .about("Local daemon turning natural-language goals into safety-vetted shell commands")
        .long_about(
            "aishelld keeps an AI provider warm behind a loopback HTTP API. The shell hotkey \
             sends a goal, gets one reviewed command back, and the user decides whether to run it.",
        )
        .arg(Arg::new("config-file")
            .long("config-file")
            .help("Path to the configuration file (default: ~/.aishell/config.toml)")
            .value_name("PATH")
            .value_parser(clap::value_parser!(PathBuf))
            .num_args(1))
        .arg(Arg::new("set-api-key")
            .long("set-api-key")
            .help("Store the API key for the OpenAI-style provider")
            .value_name("API_KEY")
            .num_args(1))
        .arg(Arg::new("show-config")
            .long("show-config")
            .help("Show the effective configuration")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("mock")
            .long("mock")
            .help("Serve canned suggestions without calling any model")
            .action(ArgAction::SetTrue))
        .get_matches();

    let config_file = matches.get_one::<PathBuf>("config-file").map(PathBuf::as_path);

    // Handle configuration commands
    if let Some(api_key) = matches.get_one::<String>("set-api-key") {
        let mut config = Config::load(config_file)?;
        config.set_api_key(api_key.clone(), config_file)?;
        println!("API key saved");
        return Ok(());
    }

    let mut config = Config::load(config_file)?;

    if matches.get_flag("show-config") {
        config.show_config_info(config_file)?;
        return Ok(());
    }

    if matches.get_flag("mock") {
        config.use_mock = true;
    }

    info!("Starting aishelld {}", env!("CARGO_PKG_VERSION"));
    aishell::daemon::serve(config).await
}
