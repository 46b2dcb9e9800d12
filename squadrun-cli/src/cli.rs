use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "squadrun")]
#[command(version, about = "SquadRun - command line client for the SquadRun API")]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// API base URL (overrides the configuration file)
    #[arg(long, global = true, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Pretty)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in and remember the session
    Login {
        username: String,

        /// Account password
        #[arg(long, env = "SQUADRUN_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create an account and sign in
    Register {
        username: String,

        email: String,

        /// Account password
        #[arg(long, env = "SQUADRUN_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Show the signed-in user
    Whoami,

    /// Show the session state
    Status,

    /// GET an API path with the session's credentials
    Get {
        /// Path relative to the API base URL, e.g. `squads/`
        path: String,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Configuration management
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Reset configuration to defaults
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable
    Pretty,
    /// Pretty-printed JSON
    Json,
    /// Single-line JSON
    JsonCompact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_get_with_globals() {
        let args = Args::try_parse_from([
            "squadrun",
            "get",
            "squads/",
            "--api-base-url",
            "http://127.0.0.1:9000/api",
            "-o",
            "json",
        ])
        .unwrap();

        assert_eq!(args.api_base_url.as_deref(), Some("http://127.0.0.1:9000/api"));
        assert_eq!(args.output, OutputFormat::Json);
        assert!(matches!(args.command, Commands::Get { ref path } if path == "squads/"));
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["squadrun", "-v", "-q", "status"]).is_err());
    }
}
