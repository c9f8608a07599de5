//! Vote server configuration management.
//!
//! Settings come from a TOML file (optional) and are then overridden by
//! environment variables. `--init-config` walks the operator through an
//! interactive setup and writes the file.

use crate::login_guard::LoginGuardSettings;
use crate::vote_guard::VoteGuardSettings;
use anyhow::{Context, Result};
use rand::distributions::{Alphanumeric, DistString};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Characters accepted as the "special" class in the admin password.
const PASSWORD_SPECIALS: &str = "@$!%*?&";

/// Vote server configuration
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to listen on (all interfaces)
    pub port: u16,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Allowed CORS origins; empty means any origin
    pub cors_origins: Vec<String>,
    /// Admin console password
    pub admin_password: Option<String>,
    /// File holding the token signing secret; generated on first run
    pub jwt_secret_path: PathBuf,
    /// Seconds between guard cleanup sweeps
    pub cleanup_interval_secs: u64,
    pub vote_guard: VoteGuardSettings,
    pub login_guard: LoginGuardSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 33000,
            database_path: PathBuf::from("data/votes.db"),
            cors_origins: Vec::new(),
            admin_password: None,
            jwt_secret_path: PathBuf::from("secrets/jwt_secret"),
            cleanup_interval_secs: 5 * 60,
            vote_guard: VoteGuardSettings::default(),
            login_guard: LoginGuardSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from file if it exists, otherwise start from defaults
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            log::info!("No config found at {:?}, using defaults and environment", config_path);
            Ok(Self::default())
        }
    }

    /// Load config from TOML file
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        let config: ServerConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config TOML")?;
        log::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;
        restrict_permissions(config_path)?;
        log::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`: ADMIN_PASSWORD, CORS_ORIGINS, PORT,
    /// DATABASE_PATH and JWT_SECRET_PATH.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(password) = lookup("ADMIN_PASSWORD") {
            self.admin_password = Some(password);
        }
        if let Some(origins) = lookup("CORS_ORIGINS") {
            self.cors_origins = parse_origins(&origins);
        }
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a valid port number, got {:?}", port))?;
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("JWT_SECRET_PATH") {
            self.jwt_secret_path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Check that the configuration is usable before starting the server.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("PORT must be a valid port number (1-65535)");
        }
        let password = self
            .admin_password
            .as_deref()
            .context("ADMIN_PASSWORD is required (set it in the environment or the config file)")?;
        validate_admin_password(password)?;
        self.vote_guard.validate()?;
        self.login_guard.validate()?;
        Ok(())
    }

    /// The admin password, wrapped for handing to the auth layer.
    pub fn admin_secret(&self) -> Result<SecretString> {
        self.admin_password
            .clone()
            .map(SecretString::new)
            .context("ADMIN_PASSWORD is not configured")
    }

    /// Interactive CLI configuration
    pub fn create_interactive() -> Result<Self> {
        println!("\n=== Vote Server Configuration ===\n");
        let defaults = Self::default();

        let port = match prompt_optional(&format!("Port (default {})", defaults.port))? {
            Some(p) => p.parse().with_context(|| format!("Invalid port {:?}", p))?,
            None => defaults.port,
        };

        let database_path = prompt_optional(&format!(
            "Database path (default {})",
            defaults.database_path.display()
        ))?
        .map(PathBuf::from)
        .unwrap_or(defaults.database_path);

        let admin_password = loop {
            let candidate = prompt_required(
                "Admin password (8+ chars, upper, lower, digit and one of @$!%*?&)",
            )?;
            match validate_admin_password(&candidate) {
                Ok(()) => break candidate,
                Err(e) => println!("{}", e),
            }
        };

        let cors_origins = prompt_optional("Allowed CORS origins, comma-separated (Enter for any)")?
            .map(|o| parse_origins(&o))
            .unwrap_or_default();

        println!("\n=== Configuration Summary ===");
        println!("  Port: {}", port);
        println!("  Database: {}", database_path.display());
        println!(
            "  CORS origins: {}",
            if cors_origins.is_empty() {
                "(any)".to_string()
            } else {
                cors_origins.join(", ")
            }
        );
        println!();

        if !prompt_yes_no("Save this configuration?", true)? {
            anyhow::bail!("Configuration cancelled by user");
        }

        Ok(Self {
            port,
            database_path,
            cors_origins,
            admin_password: Some(admin_password),
            ..defaults
        })
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        PathBuf::from("config/arcvoted.toml")
    }
}

/// Enforce the admin password policy: at least 8 characters with an
/// uppercase letter, a lowercase letter, a digit and a special character.
pub fn validate_admin_password(password: &str) -> Result<()> {
    if password.chars().count() < 8 {
        anyhow::bail!("Admin password must be at least 8 characters long");
    }
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| PASSWORD_SPECIALS.contains(c));
    if !(has_lower && has_upper && has_digit && has_special) {
        anyhow::bail!(
            "Admin password must contain at least one uppercase letter, one lowercase letter, \
             one number, and one special character ({})",
            PASSWORD_SPECIALS
        );
    }
    Ok(())
}

/// Read the token signing secret, generating and storing a new one on first run.
pub fn read_or_create_secret(secret_path: &Path) -> Result<SecretString> {
    if !secret_path.exists() {
        if let Some(parent) = secret_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let generated = Alphanumeric.sample_string(&mut rand::thread_rng(), 48);
        std::fs::write(secret_path, &generated)
            .with_context(|| format!("Failed to write secret to {:?}", secret_path))?;
        restrict_permissions(secret_path)?;
        log::info!("Generated new token secret and stored at: {}", secret_path.display());
        return Ok(SecretString::new(generated));
    }

    let secret = std::fs::read_to_string(secret_path)
        .with_context(|| format!("Failed to read secret from {:?}", secret_path))?
        .trim()
        .to_string();
    if secret.is_empty() {
        anyhow::bail!(
            "Secret file {} is empty. Delete it and restart to generate a new one.",
            secret_path.display()
        );
    }
    Ok(SecretString::new(secret))
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Prompt for required input
fn prompt_required(prompt: &str) -> Result<String> {
    loop {
        print!("{}: ", prompt);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim().to_string();

        if !input.is_empty() {
            return Ok(input);
        }
        println!("This field is required.");
    }
}

/// Prompt for optional input
fn prompt_optional(prompt: &str) -> Result<Option<String>> {
    print!("{}: ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_string();

    Ok(if input.is_empty() { None } else { Some(input) })
}

/// Prompt for yes/no
fn prompt_yes_no(prompt: &str, default: bool) -> Result<bool> {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    print!("{} {}: ", prompt, hint);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    Ok(match input.as_str() {
        "y" | "yes" => true,
        "n" | "no" => false,
        _ => default,
    })
}
