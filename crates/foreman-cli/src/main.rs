mod api;
mod config;
mod dispatch_cmd;
mod serve_cmd;

use std::io;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use foreman_db::pool;

use config::{CliOverrides, ResolvedConfig};

#[derive(Parser)]
#[command(
    name = "foreman",
    about = "Autonomous work-dispatch harness for AI coding agent CLIs"
)]
struct Cli {
    /// Data directory (overrides FOREMAN_DATA_DIR and the config file)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// Database URL (overrides FOREMAN_DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a foreman config file with a fresh encryption key (no database required)
    Init {
        /// Data directory to record in the config file
        #[arg(long)]
        data_dir: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and run migrations
    DbInit,
    /// Run the HTTP API (and optionally the dispatcher loop)
    Serve {
        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (default: 7420)
        #[arg(long)]
        port: Option<u16>,
        /// Start the dispatcher loop immediately
        #[arg(long)]
        start_loop: bool,
    },
    /// Dispatch one work item now and wait for its stage to finish
    Dispatch {
        /// Work item ID
        id: i64,
    },
    /// Print shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Execute the `foreman init` command: write config file.
fn cmd_init(data_dir: Option<String>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let key = config::generate_encryption_key();
    let cfg = config::ConfigFile {
        harness: config::HarnessSection {
            data_dir: data_dir.clone(),
            encryption_key: Some(key.clone()),
            ..config::HarnessSection::default()
        },
        server: config::ServerSection::default(),
    };
    config::save_config(&path, &cfg)?;

    println!("Config written to {}", path.display());
    if let Some(dir) = &data_dir {
        println!("  harness.data_dir = {dir}");
    }
    println!("  harness.encryption_key = {}...{}", &key[..8], &key[56..]);
    println!();
    println!("Next: run `foreman db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `foreman db-init` command: create database and run migrations.
async fn cmd_db_init(resolved: &ResolvedConfig) -> anyhow::Result<()> {
    let harness = &resolved.harness;
    println!("Initializing foreman database...");

    harness.ensure_dirs()?;
    let db_pool = pool::create_pool(&harness.database).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready at {}. Tables:", harness.database.database_url);
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("foreman db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = CliOverrides {
        data_dir: cli.data_dir.clone(),
        database_url: cli.database_url.clone(),
    };

    match cli.command {
        Commands::Init { data_dir, force } => {
            cmd_init(data_dir.or(cli.data_dir), force)?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "foreman", &mut io::stdout());
        }
        Commands::DbInit => {
            let resolved = ResolvedConfig::resolve(&overrides)?;
            cmd_db_init(&resolved).await?;
        }
        Commands::Serve {
            bind,
            port,
            start_loop,
        } => {
            let mut resolved = ResolvedConfig::resolve(&overrides)?;
            if let Some(port) = port {
                resolved.port = port;
                if std::env::var_os("FOREMAN_OAUTH_CALLBACK_PORT").is_none() {
                    resolved.harness.oauth_callback_port = port;
                }
            }
            if let Some(bind) = bind {
                resolved.bind = bind;
            }
            serve_cmd::run_serve(resolved, start_loop).await?;
        }
        Commands::Dispatch { id } => {
            let resolved = ResolvedConfig::resolve(&overrides)?;
            dispatch_cmd::run_dispatch(resolved.harness, id).await?;
        }
    }

    Ok(())
}
