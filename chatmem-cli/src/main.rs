//! chatmem: command-line front end for the chatmem session repository
//!
//! Every subcommand maps onto one repository operation and prints the
//! resulting entity as JSON.
//!
//! # Subcommands
//! - `user add|get|update|delete`
//! - `session new|list|search|show|remove`
//! - `message append <user> <session> --role <role> <content>`: append and flush

use chatmem_core::{ChatmemConfig, Message, SessionRepo, User};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LIMIT: usize = 10;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "chatmem", version, about = "Chat users and sessions backed by Zep Cloud")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "CHATMEM_CONFIG", default_value = "chatmem.toml")]
    config: String,

    /// Zep API key (overrides config and ZEP_API_KEY)
    #[arg(long, env = "CHATMEM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage users
    #[command(subcommand)]
    User(UserCommand),

    /// Manage sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Append to session history
    #[command(subcommand)]
    Message(MessageCommand),
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Create a user
    Add {
        username: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
    },
    /// Show a user
    Get { username: String },
    /// Change email or names of a user
    Update {
        username: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
    },
    /// Delete a user (soft by default)
    Delete {
        username: String,
        /// Also remove every session of the user
        #[arg(long)]
        hard: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// Start a session for a user
    New {
        username: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// List a user's sessions, most recent first
    List {
        username: String,
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Search a user's sessions
    Search {
        username: String,
        query: String,
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
    /// Show a session with its recent history
    Show { username: String, session_id: String },
    /// Remove a session
    Remove { username: String, session_id: String },
}

#[derive(Debug, Subcommand)]
enum MessageCommand {
    /// Append one message and flush it
    Append {
        username: String,
        session_id: String,
        #[arg(long, default_value = "user")]
        role: String,
        content: String,
    },
}

// ============================================================================
// Command handlers
// ============================================================================

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_user(repo: &SessionRepo, command: UserCommand) -> anyhow::Result<()> {
    match command {
        UserCommand::Add {
            username,
            email,
            first_name,
            last_name,
        } => {
            let mut user = User::new(username);
            user.email = email;
            user.first_name = first_name;
            user.last_name = last_name;
            print_json(&repo.add_user(user).await?)
        }
        UserCommand::Get { username } => print_json(&repo.get_user(&username).await?),
        UserCommand::Update {
            username,
            email,
            first_name,
            last_name,
        } => {
            let mut user = repo.get_user(&username).await?;
            if email.is_some() {
                user.email = email;
            }
            if first_name.is_some() {
                user.first_name = first_name;
            }
            if last_name.is_some() {
                user.last_name = last_name;
            }
            print_json(&repo.update_user(&user).await?)
        }
        UserCommand::Delete { username, hard } => {
            repo.delete_user(&username, hard).await?;
            println!("Deleted user {} ({})", username, if hard { "hard" } else { "soft" });
            Ok(())
        }
    }
}

async fn run_session(repo: &SessionRepo, command: SessionCommand) -> anyhow::Result<()> {
    match command {
        SessionCommand::New { username, title } => {
            print_json(&repo.new_session(&username, title.as_deref(), None).await?)
        }
        SessionCommand::List {
            username,
            limit,
            offset,
        } => print_json(&repo.get_user_sessions(&username, limit, offset).await?),
        SessionCommand::Search {
            username,
            query,
            limit,
        } => print_json(&repo.search_user_sessions(&username, &query, limit).await?),
        SessionCommand::Show {
            username,
            session_id,
        } => print_json(&repo.get_user_session(&username, &session_id).await?),
        SessionCommand::Remove {
            username,
            session_id,
        } => {
            repo.remove_user_session(&username, &session_id).await?;
            println!("Removed session {}", session_id);
            Ok(())
        }
    }
}

async fn run_message(repo: &SessionRepo, command: MessageCommand) -> anyhow::Result<()> {
    match command {
        MessageCommand::Append {
            username,
            session_id,
            role,
            content,
        } => {
            let mut session = repo.get_user_session(&username, &session_id).await?;
            session.add_message(Message::new(role, content));
            let report = repo.flush(&mut session).await?;
            println!("Flushed {} entries to session {}", report.entries_written, session_id);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = match ChatmemConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.api_key.is_some() {
        config.zep.api_key = cli.api_key;
    }
    tracing::debug!(config = %cli.config, base_url = %config.zep.base_url, "Loaded configuration");

    let repo = SessionRepo::from_app_config(&config)?;

    match cli.command {
        Commands::User(command) => run_user(&repo, command).await,
        Commands::Session(command) => run_session(&repo, command).await,
        Commands::Message(command) => run_message(&repo, command).await,
    }
}

// ============================================================================
// TESTS
// ============================================================================
