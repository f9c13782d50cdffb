mod cli;
mod commands;
mod config;
mod error;
mod output;
mod sim;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, GlobalOpts};
use crate::config::{LogFormat, LoggingSection};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Dispatch and handle errors with proper exit codes
    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Verbosity flags override the configured level; `RUST_LOG` overrides both.
fn init_tracing(global: &GlobalOpts, logging: &LoggingSection) {
    let level = match (global.quiet, global.verbose) {
        (true, _) => "error",
        (false, 0) => logging.level.as_str(),
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Shell completions generation
        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "devhost", &mut std::io::stdout());
            Ok(())
        }

        Command::Check(args) => {
            let config = config::load(&cli.global)?;
            init_tracing(&cli.global, &config.logging);
            commands::check::handle(&args, &config, &cli.global)
        }

        Command::Run(args) => {
            let config = config::load(&cli.global)?;
            init_tracing(&cli.global, &config.logging);
            tracing::debug!(path = %config::resolve_path(&cli.global).display(), "configuration loaded");
            commands::run::handle(&args, &config, &cli.global).await
        }
    }
}
