use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackform")]
#[command(version)]
#[command(about = "Plan, apply and drift-check declarative resource stacks", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Template file (.json, .yaml, .yml or .toml)
    #[arg(short, long, global = true, env = "STACKFORM_TEMPLATE")]
    pub template: Option<PathBuf>,

    /// Parameter value, repeatable (KEY=VALUE)
    #[arg(short, long = "param", global = true, value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// File of parameter values (JSON or TOML)
    #[arg(long, global = true)]
    pub params_file: Option<PathBuf>,

    /// Stack name (default: from config, then the template file name)
    #[arg(short, long, global = true, env = "STACKFORM_STACK")]
    pub stack: Option<String>,

    /// Config file (default: ./stackform.toml, then the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change (exit 0: none, 2: changes pending)
    Plan(PlanArgs),

    /// Make recorded resources match the template
    Apply(ApplyArgs),

    /// Check the template and parameters without touching state
    Validate,

    /// Delete every resource of the stack (Retain resources are kept)
    Destroy(DestroyArgs),

    /// Compare recorded resources with what providers report
    Drift(JsonArgs),

    /// Show outputs of the last successful apply
    Outputs(JsonArgs),

    /// Inspect recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Clear a lock left behind by a crashed run
    ForceUnlock {
        /// Fencing token of the lock to clear
        token: u64,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct PlanArgs {
    /// Read resources back from providers before planning
    #[arg(long)]
    pub refresh: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub auto_approve: bool,

    /// Maximum provider calls in flight (default: from config, then 4)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Read resources back from providers before planning
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub auto_approve: bool,

    /// Maximum provider calls in flight (default: from config, then 4)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct JsonArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one recorded resource as JSON
    Show {
        /// Logical id of the resource
        logical_id: String,
    },

    /// Show the current lock holder, if any
    Lock,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing parameter name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("Env=prod").unwrap(),
            ("Env".to_string(), "prod".to_string())
        );
        assert_eq!(
            parse_param("Query=a=b").unwrap(),
            ("Query".to_string(), "a=b".to_string())
        );
        assert!(parse_param("Env").is_err());
        assert!(parse_param("=prod").is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stackform", "apply", "-y", "-t", "stack.yaml", "-p", "Env=prod", "--jobs", "2",
        ])
        .unwrap();
        assert_eq!(cli.template, Some(PathBuf::from("stack.yaml")));
        assert_eq!(cli.params.len(), 1);
        match cli.command {
            Command::Apply(args) => {
                assert!(args.auto_approve);
                assert_eq!(args.jobs, Some(2));
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_force_unlock_takes_token() {
        let cli = Cli::try_parse_from(["stackform", "force-unlock", "7"]).unwrap();
        assert!(matches!(cli.command, Command::ForceUnlock { token: 7 }));
    }
}
