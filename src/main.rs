//! Audiobook Store - admin tool
//!
//! Opens the configured engine and runs maintenance commands against it.

use audiobook_store::core::config::{CliArgs, Config};
use audiobook_store::core::{Logger, SecretManager};
use audiobook_store::db::{self, migrations, EngineKind, SettingsService, SqliteStore};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "audiobook-store", version, about = "Audiobook library storage maintenance")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending migrations
    Migrate,
    /// Show applied migrations
    History,
    /// Copy the relational database to a file
    Backup {
        #[arg(value_name = "FILE")]
        output: PathBuf,
    },
    /// Delete every record
    Reset {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Inspect or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    /// List settings with secrets masked
    List,
    /// Store a setting
    Set {
        key: String,
        value: String,
        #[arg(long, default_value = "string")]
        value_type: String,
        /// Encrypt the value at rest
        #[arg(long)]
        secret: bool,
    },
    /// Remove a setting
    Delete { key: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration (handles CLI args, env vars, and config file)
    let config = match Config::load_with(&cli.args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting audiobook-store v{}", audiobook_store::VERSION);
    info!(
        engine = %config.database.engine,
        path = ?config.database.path,
        "Database configuration"
    );

    match cli.command {
        Command::Migrate => {
            let store = db::open_store(&config.database)?;
            let version = migrations::run_migrations(store.as_ref())?;
            info!(version, "Database migrated");
        }
        Command::History => {
            let store = db::open_store(&config.database)?;
            let current = migrations::current_version(store.as_ref())?;
            println!("current version: {}", current);
            for record in migrations::migration_history(store.as_ref())? {
                println!(
                    "{:>3}  {}  {}",
                    record.version,
                    record.applied_at.to_rfc3339(),
                    record.description
                );
            }
        }
        Command::Backup { output } => {
            if config.database.engine != EngineKind::Sqlite {
                bail!("backup is only available for the sqlite engine");
            }
            let store = SqliteStore::open(
                &config.database.path,
                config.database.connection_pool_size,
                Duration::from_millis(config.database.busy_timeout),
            )?;
            store
                .backup(&output)
                .with_context(|| format!("Failed to back up to {:?}", output))?;
            info!(output = ?output, "Backup written");
        }
        Command::Reset { yes } => {
            if !yes {
                bail!("reset deletes every record; pass --yes to confirm");
            }
            let store = db::open_store(&config.database)?;
            store.reset()?;
            info!("All records deleted");
        }
        Command::Settings { action } => {
            let store = db::open_store(&config.database)?;
            std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
                format!("Failed to create directory {:?}", config.storage.data_dir)
            })?;
            let secrets = SecretManager::load_or_create(&config.storage.data_dir)?;
            let settings = SettingsService::new(store, secrets);
            match action {
                SettingsAction::List => {
                    for setting in settings.list_masked()? {
                        let marker = if setting.is_secret { " (secret)" } else { "" };
                        println!("{} = {}{}", setting.key, setting.value, marker);
                    }
                }
                SettingsAction::Set {
                    key,
                    value,
                    value_type,
                    secret,
                } => {
                    settings.set(&key, &value, &value_type, secret)?;
                    info!(key = %key, secret, "Setting stored");
                }
                SettingsAction::Delete { key } => {
                    settings.delete(&key)?;
                    info!(key = %key, "Setting deleted");
                }
            }
        }
    }

    Ok(())
}
