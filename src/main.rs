//! WeConnect call client
//!
//! Places and answers WeConnect audio/video calls from the terminal.

mod api;
mod auth;
mod calling;
mod config;
mod models;
mod signaling;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "weconnect-call")]
#[command(about = "Terminal audio/video calling for WeConnect", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a WeConnect token
    Login {
        /// Server base URL, e.g. https://weconnect.example.com
        #[arg(short, long)]
        server: String,

        /// Bearer token issued by the server
        #[arg(short, long)]
        token: String,

        /// Own user id (taken from the token or the server when omitted)
        #[arg(long)]
        user_id: Option<String>,
    },

    /// Log out and clear cached credentials
    Logout,

    /// Show current authentication status
    Status,

    /// Show own profile (verify auth works)
    Whoami,

    /// Call the other participant of a conversation
    Call {
        /// Conversation ID
        conversation_id: String,

        /// User to call (resolved from the conversation when omitted)
        #[arg(long)]
        to: Option<String>,

        /// Audio only
        #[arg(long)]
        audio: bool,

        /// Seconds to keep the call up once connected
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },

    /// Wait for incoming calls
    Listen {
        /// Answer every incoming call
        #[arg(long)]
        auto_accept: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            server,
            token,
            user_id,
        } => {
            tracing::info!("Storing credentials for {}...", server);
            auth::login(&server, &token, user_id).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout().await?;
        }
        Commands::Status => {
            auth::status().await?;
        }
        Commands::Whoami => {
            api::whoami().await?;
        }
        Commands::Call {
            conversation_id,
            to,
            audio,
            duration,
        } => {
            calling::runner::run_call(&conversation_id, to, audio, duration).await?;
        }
        Commands::Listen { auto_accept } => {
            calling::runner::run_listen(auto_accept).await?;
        }
    }

    Ok(())
}
