#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;

use rsmediadrm::config::ManagerConfig;
use rsmediadrm::store::{FileStore, PersistentStore};
use rsmediadrm::utils::to_hex;
use rsmediadrm::SessionToken;

#[cfg(feature = "chrono")]
use chrono::Datelike;

use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "rsmediadrm", version, disable_version_flag = true, about = "rsmediadrm CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// List origins and the offline licenses stored for them.
    List { store: PathBuf },
    /// Show one stored offline license as YAML.
    Show {
        store: PathBuf,
        origin: String,
        token: String,
    },
    /// Delete one stored offline license.
    Clear {
        store: PathBuf,
        origin: String,
        token: String,
    },
    /// Print whether an origin has been provisioned.
    Provisioned { store: PathBuf, origin: String },
    /// Record an origin as provisioned.
    MarkProvisioned { store: PathBuf, origin: String },
    /// Load and validate a manager YAML config.
    CheckConfig { config_path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!(
        "rsmediadrm version {} Copyright (c) 2024-{} rsmediadrm contributors",
        version,
        current_year()
    );

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::List { store }) => run_list(&store),
        Some(Commands::Show {
            store,
            origin,
            token,
        }) => run_show(&store, &origin, &token),
        Some(Commands::Clear {
            store,
            origin,
            token,
        }) => run_clear(&store, &origin, &token),
        Some(Commands::Provisioned { store, origin }) => run_provisioned(&store, &origin),
        Some(Commands::MarkProvisioned { store, origin }) => run_mark_provisioned(&store, &origin),
        Some(Commands::CheckConfig { config_path }) => run_check_config(&config_path),
        None => Ok(()),
    }
}

fn current_year() -> i64 {
    #[cfg(feature = "chrono")]
    {
        chrono::Local::now().year().into()
    }
    #[cfg(not(feature = "chrono"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() / 31_536_000 + 1970)
            .unwrap_or(2024) as i64
    }
}

fn format_timestamp(secs: u64) -> String {
    #[cfg(feature = "chrono")]
    {
        i64::try_from(secs)
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| secs.to_string())
    }
    #[cfg(not(feature = "chrono"))]
    {
        secs.to_string()
    }
}

fn open_store(path: &Path) -> anyhow::Result<FileStore> {
    FileStore::open(path).with_context(|| format!("Failed to open store {}", path.display()))
}

fn parse_token(token: &str) -> anyhow::Result<SessionToken> {
    SessionToken::from_str(token).context("Invalid session token")
}

fn run_list(path: &Path) -> anyhow::Result<()> {
    let store = open_store(path)?;
    let mut origins = 0usize;
    for (origin, entry) in store.origins() {
        origins += 1;
        let name = if origin.is_empty() { "<none>" } else { origin };
        info!(
            "[{}] provisioned: {}, licenses: {}",
            name,
            entry.provisioned,
            entry.licenses.len()
        );
        for (token, license) in &entry.licenses {
            info!(
                "  {} {} stored {}",
                token,
                license.mime_type,
                format_timestamp(license.stored_at)
            );
        }
    }
    if origins == 0 {
        warn!("Store {} is empty", path.display());
    }
    Ok(())
}

#[derive(Serialize)]
struct LicenseView {
    origin: String,
    token: String,
    mime_type: String,
    key_set_id: String,
    stored_at: String,
}

fn run_show(path: &Path, origin: &str, token: &str) -> anyhow::Result<()> {
    let store = open_store(path)?;
    let token = parse_token(token)?;
    let Some(record) = store.load_keyset(origin, token)? else {
        error!("No license for {} in origin '{}'", token, origin);
        return Ok(());
    };
    let view = LicenseView {
        origin: origin.to_string(),
        token: token.to_string(),
        mime_type: record.mime_type,
        key_set_id: to_hex(record.key_set_id.as_bytes()),
        stored_at: format_timestamp(record.stored_at),
    };
    print!("{}", serde_yaml::to_string(&view)?);
    Ok(())
}

fn run_clear(path: &Path, origin: &str, token: &str) -> anyhow::Result<()> {
    let mut store = open_store(path)?;
    let token = parse_token(token)?;
    store
        .clear_keyset(origin, token)
        .context("Failed to clear license")?;
    info!("[+] Cleared license {} in origin '{}'", token, origin);
    Ok(())
}

fn run_provisioned(path: &Path, origin: &str) -> anyhow::Result<()> {
    let store = open_store(path)?;
    let provisioned = store.is_origin_provisioned(origin)?;
    match store.origin(origin).and_then(|entry| entry.provisioned_at) {
        Some(at) if provisioned => info!(
            "Origin '{}' provisioned at {}",
            origin,
            format_timestamp(at)
        ),
        _ => info!("Origin '{}' provisioned: {}", origin, provisioned),
    }
    Ok(())
}

fn run_mark_provisioned(path: &Path, origin: &str) -> anyhow::Result<()> {
    let mut store = open_store(path)?;
    store
        .mark_origin_provisioned(origin)
        .context("Failed to update store")?;
    info!("[+] Marked origin '{}' as provisioned", origin);
    Ok(())
}

fn run_check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = ManagerConfig::from_path(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    info!("[+] Config OK");
    info!("scheme: {}", config.scheme);
    info!(
        "origin: {}",
        if config.has_origin() { config.origin.as_str() } else { "<none>" }
    );
    if let Some(level) = &config.security_level {
        info!("security level: {}", level);
    }
    if let Some(certificate) = &config.server_certificate {
        info!("server certificate: {} bytes", certificate.len());
    }
    info!(
        "provision unprovisioned origins: {}",
        config.provision_unprovisioned_origins
    );
    Ok(())
}
