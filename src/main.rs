//! # Resource Share CLI (`rshare`)
//!
//! ## Usage
//!
//! ```bash
//! rshare --config ./config/share.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rshare init` | Create the SQLite database and run schema migrations |
//! | `rshare serve` | Recover interrupted uploads and start the HTTP server |
//! | `rshare token --user <id>` | Mint a bearer token for API calls |
//! | `rshare tasks` | List persisted upload tasks |
//! | `rshare purge` | Delete finished tasks older than the retention window |
//!
//! Log verbosity follows `RUST_LOG` (default `info,tower_http=info`).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use resource_share::auth::{Caller, Role, TokenSigner};
use resource_share::{config, migrate, server, tasks};

/// Resource Share: resumable uploads for a file-sharing service.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/share.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "rshare", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/share.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server.
    ///
    /// Uploads that were merging or finalizing when the process last
    /// stopped are resumed before the listener opens.
    Serve,

    /// Mint a bearer token signed with `[auth].secret`.
    Token {
        /// User id the token identifies.
        #[arg(long)]
        user: i64,

        #[arg(long, value_enum, default_value = "user")]
        role: RoleArg,
    },

    /// List persisted upload tasks that a restart would reload.
    Tasks {
        /// Only show tasks owned by this user id.
        #[arg(long)]
        owner: Option<i64>,
    },

    /// Delete completed and failed tasks older than `[upload].retention_hours`.
    Purge,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    User,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::User => Role::User,
            RoleArg::Admin => Role::Admin,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Token { user, role } => {
            let signer = TokenSigner::new(&cfg.auth.secret, cfg.auth.token_ttl())?;
            let caller = Caller {
                user_id: user,
                role: role.into(),
            };
            println!("{}", signer.issue(&caller));
        }
        Commands::Tasks { owner } => {
            tasks::run_tasks(&cfg, owner).await?;
        }
        Commands::Purge => {
            tasks::run_purge(&cfg).await?;
        }
    }

    Ok(())
}
