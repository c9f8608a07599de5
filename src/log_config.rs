//! Logging backend for the `log` facade.
//!
//! Level comes from `RUST_LOG` (default `info`). Output goes to the given file,
//! or to stderr when the path is `-`.

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub fn init_logging(log_file: &str) -> Result<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}: {}",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if log_file == "-" {
        builder.target(Target::Stderr);
    } else {
        if let Some(parent) = Path::new(log_file).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("Failed to open log file {}", log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .context("Logger already initialized")?;
    Ok(())
}
