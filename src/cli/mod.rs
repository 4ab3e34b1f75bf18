//! Command-line interface for tenantdesk.
//!
//! Subcommands:
//! - `serve` - Run the API server (default when no subcommand is given)
//! - `migrate` - Apply database migrations and exit
//! - `create-admin` - Create a platform admin user
//! - `config-check` - Validate the configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "tenantdesk")]
#[command(author, version, about = "Multi-tenant back office API", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "TENANTDESK_CONFIG", default_value = "tenantdesk.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Subcommand to run (if none, starts the server)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the API server
    Serve,

    /// Apply database migrations and exit
    Migrate,

    /// Create a platform admin user
    CreateAdmin {
        /// Login email
        #[arg(long)]
        email: String,
        /// Display name
        #[arg(long, default_value = "Platform Admin")]
        name: String,
        /// Password (can also be set via TENANTDESK_ADMIN_PASSWORD)
        #[arg(long, env = "TENANTDESK_ADMIN_PASSWORD")]
        password: String,
    },

    /// Validate configuration file
    ConfigCheck,
}

impl Cli {
    /// Whether this invocation should start the server
    pub fn is_serve(&self) -> bool {
        matches!(self.command, None | Some(Commands::Serve))
    }
}

/// Run a non-server CLI command
pub async fn run_command(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Some(Commands::Migrate) => cmd_migrate(config).await,
        Some(Commands::CreateAdmin {
            email,
            name,
            password,
        }) => cmd_create_admin(config, email, name, password).await,
        Some(Commands::ConfigCheck) => cmd_config_check(cli),
        // Serving is handled in main.rs
        Some(Commands::Serve) | None => Ok(()),
    }
}

async fn cmd_migrate(config: &Config) -> Result<()> {
    crate::db::init(&config.database)
        .await
        .context("Failed to migrate database")?;
    println!("[OK] Database is up to date ({})", config.database.url);
    Ok(())
}

async fn cmd_create_admin(config: &Config, email: &str, name: &str, password: &str) -> Result<()> {
    let db = crate::db::init(&config.database).await?;
    let user = crate::api::auth::create_platform_admin(&db, email, name, password).await?;
    println!("[OK] Created platform admin {} ({})", user.email, user.id);
    Ok(())
}

fn cmd_config_check(cli: &Cli) -> Result<()> {
    let config_path = &cli.config;

    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!(
            "[!!] Configuration file not found: {}",
            config_path.display()
        );
        println!();
        println!("A default configuration will be used when starting the server.");
        return Ok(());
    }

    match Config::load(config_path) {
        Ok(config) => {
            println!("[OK] Configuration file is valid!");
            println!();
            println!("=== Configuration Summary ===");
            println!();
            println!("Server:");
            println!("  Listen:       {}:{}", config.server.host, config.server.port);
            println!("  Database:     {}", config.database.url);
            println!("  Log Level:    {}", config.logging.level);
            println!();
            println!("Background tasks:");
            println!("  Retention:    {}", on_off(config.retention.enabled));
            println!("  Scheduler:    {}", on_off(config.pipelines.scheduler_enabled));
            println!("  Rate Limits:  {}", on_off(config.rate_limit.enabled));
            println!();

            let warnings = config_warnings(&config);
            if !warnings.is_empty() {
                println!("Warnings:");
                for warning in warnings {
                    println!("  [!] {}", warning);
                }
                println!();
            }

            Ok(())
        }
        Err(e) => {
            println!("[!!] Configuration file is invalid!");
            println!();
            println!("Error: {:#}", e);
            anyhow::bail!("Invalid configuration file");
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "Enabled"
    } else {
        "Disabled"
    }
}

fn config_warnings(config: &Config) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.auth.admin_token.len() < 32 {
        warnings.push("Admin token is shorter than 32 characters");
    }
    if config.auth.bootstrap_email.is_some() != config.auth.bootstrap_password.is_some() {
        warnings.push("Bootstrap admin needs both bootstrap_email and bootstrap_password");
    }
    if !config.rate_limit.enabled {
        warnings.push("Rate limiting is disabled");
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_serves() {
        let cli = Cli::try_parse_from(["tenantdesk"]).unwrap();
        assert!(cli.is_serve());
        assert_eq!(cli.config, PathBuf::from("tenantdesk.toml"));
    }

    #[test]
    fn test_create_admin_args() {
        let cli = Cli::try_parse_from([
            "tenantdesk",
            "--log-level",
            "debug",
            "create-admin",
            "--email",
            "ops@example.com",
            "--password",
            "Sup3r-Secret-Pass",
        ])
        .unwrap();

        assert!(!cli.is_serve());
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(
            cli.command,
            Some(Commands::CreateAdmin {
                email: "ops@example.com".to_string(),
                name: "Platform Admin".to_string(),
                password: "Sup3r-Secret-Pass".to_string(),
            })
        );
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["tenantdesk", "deploy"]).is_err());
    }

    #[test]
    fn test_config_warnings() {
        let mut config = Config::default();
        config.auth.admin_token = "short".to_string();
        config.auth.bootstrap_email = Some("ops@example.com".to_string());
        config.rate_limit.enabled = false;

        let warnings = config_warnings(&config);
        assert_eq!(warnings.len(), 3);
    }
}
