mod coach;
mod commands;
mod config;
mod openfoodfacts;
mod remote;
mod retry;
mod server;

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    ProfileArgs, cmd_goal_history, cmd_goal_show, cmd_progress_monthly, cmd_progress_weekly,
    cmd_remote_status, cmd_remote_summary, cmd_summary, cmd_user_create, cmd_user_delete,
    cmd_user_list,
};
use crate::config::Config;
use nourish_core::db::Database;

const DEFAULT_REMOTE_URL: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(
    name = "nourish",
    version,
    about = "Nutrition and fitness tracker: REST API server and admin CLI"
)]
struct Cli {
    /// Database file (overrides NOURISH_DB and the default data directory)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on (default from config, else 8080)
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to (default from config, else 127.0.0.1)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Manage accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Show a user's daily summary (defaults to today)
    Summary {
        username: String,
        /// Date to show (YYYY-MM-DD, default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Weekly or monthly progress report
    Progress {
        #[command(subcommand)]
        command: ProgressCommands,
    },
    /// Inspect calorie goals
    Goal {
        #[command(subcommand)]
        command: GoalCommands,
    },
    /// Talk to a running server
    Remote {
        /// Server base URL
        #[arg(long, global = true, default_value = DEFAULT_REMOTE_URL)]
        url: String,
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create an account (prompts for the password when --password is omitted)
    Create {
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: Option<String>,
        #[command(flatten)]
        profile: ProfileArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List accounts
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an account and all of its data
    Delete {
        username: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProgressCommands {
    /// Seven days ending on --end (default: today)
    Weekly {
        username: String,
        #[arg(long)]
        end: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Every day of --month (YYYY-MM, default: this month) with weekly subtotals
    Monthly {
        username: String,
        #[arg(long)]
        month: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum GoalCommands {
    /// Every recorded goal change
    History {
        username: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// The goal in effect on a date
    Show {
        username: String,
        /// Date (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// Check whether the server answers its health check
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fetch a daily summary from the server
    Summary {
        /// Session token from /login
        #[arg(long)]
        token: Option<String>,
        /// Date (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    });

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Remote commands never touch the local database.
    if let Commands::Remote { url, command } = cli.command {
        return match command {
            RemoteCommands::Status { json } => cmd_remote_status(&url, json).await,
            RemoteCommands::Summary { token, date, json } => {
                cmd_remote_summary(&url, token, date, json).await
            }
        };
    }

    let mut config = Config::load(cli.db)?;
    tracing::debug!(db = %config.db_path.display(), data_dir = %config.data_dir.display(), "configuration loaded");
    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                config.settings.server.port = port;
            }
            if let Some(bind) = bind {
                config.settings.server.bind = bind;
            }
            server::start_server(db, &config.settings).await
        }
        Commands::User { command } => match command {
            UserCommands::Create {
                username,
                email,
                password,
                profile,
                json,
            } => cmd_user_create(&db, &username, &email, password, profile, json),
            UserCommands::List { json } => cmd_user_list(&db, json),
            UserCommands::Delete { username, json } => cmd_user_delete(&db, &username, json),
        },
        Commands::Summary {
            username,
            date,
            json,
        } => cmd_summary(&db, &username, date, json),
        Commands::Progress { command } => match command {
            ProgressCommands::Weekly {
                username,
                end,
                json,
            } => cmd_progress_weekly(&db, &username, end, json),
            ProgressCommands::Monthly {
                username,
                month,
                json,
            } => cmd_progress_monthly(&db, &username, month, json),
        },
        Commands::Goal { command } => match command {
            GoalCommands::History { username, json } => cmd_goal_history(&db, &username, json),
            GoalCommands::Show {
                username,
                date,
                json,
            } => cmd_goal_show(&db, &username, date, json),
        },
        Commands::Remote { .. } => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::try_parse_from(["nourish", "--db", "/tmp/x.db", "serve", "-p", "9000"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Commands::Serve { port, bind } => {
                assert_eq!(port, Some(9000));
                assert!(bind.is_none());
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_user_create_with_profile() {
        let cli = Cli::try_parse_from([
            "nourish", "user", "create", "alice", "--email", "a@example.com", "--height", "170",
            "--activity", "moderate",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::User {
                command: UserCommands::Create { .. }
            }
        ));
    }
}
