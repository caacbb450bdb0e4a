mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod providers;
mod ui;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use commands::Status;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub template: Option<PathBuf>,
    pub params: Vec<(String, String)>,
    pub params_file: Option<PathBuf>,
    pub stack: Option<String>,
    pub config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        template: cli.template,
        params: cli.params,
        params_file: cli.params_file,
        stack: cli.stack,
        config: cli.config,
    };

    let result = match &cli.command {
        Command::Plan(args) => commands::plan::run(&ctx, args),
        Command::Apply(args) => commands::apply::apply(&ctx, args),
        Command::Validate => commands::validate::run(&ctx),
        Command::Destroy(args) => commands::apply::destroy(&ctx, args),
        Command::Drift(args) => commands::drift::run(&ctx, args),
        Command::Outputs(args) => commands::state::outputs(&ctx, args),
        Command::State(cmd) => commands::state::run(&ctx, cmd),
        Command::ForceUnlock { token } => commands::state::force_unlock(&ctx, *token),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(*shell, &mut cmd, "stackform", &mut io::stdout());
            Ok(Status::Clean)
        }
    };

    match result {
        Ok(status) => status.exit_code(),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            if let Some(declarative::Error::Lock(statestore::Error::LockHeld { holder })) =
                e.downcast_ref::<declarative::Error>()
            {
                ui::dim(&format!(
                    "If that run is gone, clear the lock with `stackform force-unlock {}`",
                    holder.token
                ));
            }
            if ctx.verbose > 0 {
                log::debug!("{e:?}");
            }
            Status::Failed.exit_code()
        }
    }
}
