//! Command-line interface for the udfhost function catalog.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use udfhost_core::config::env_vars;
use udfhost_core::library::LibraryManager;
use udfhost_core::{CatalogSync, FunctionDefinition, FunctionKind, ReturnType, UdfConfig};
use udfhost_storage::FunctionStore;

/// udfctl - Manage native user-defined functions.
#[derive(Parser, Debug)]
#[command(name = "udfctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Function catalog database.
    #[arg(long, global = true, default_value = "func.redb")]
    db: PathBuf,

    /// TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory extension libraries are loaded from.
    #[arg(long, global = true)]
    plugin_dir: Option<PathBuf>,

    /// Bind functions that export neither `_init` nor `_deinit`.
    #[arg(long, global = true)]
    allow_suspicious: bool,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// List catalog rows.
    List,
    /// Load every catalog row as a server would at startup and report.
    Check,
    /// Register a function from an extension library.
    Create {
        /// Function name; also the exported symbol.
        name: String,
        /// Library file inside the plugin directory.
        library: String,
        /// Return type: string, real, integer or decimal.
        #[arg(long)]
        returns: ReturnType,
        /// Register an aggregate function.
        #[arg(long)]
        aggregate: bool,
    },
    /// Remove a function.
    Drop {
        /// Function name.
        name: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config = load_config(&args)?;
    match args.command {
        Command::List => list(&args.db),
        Command::Check => check(&args.db, &config),
        Command::Create {
            ref name,
            ref library,
            returns,
            aggregate,
        } => {
            let kind = if aggregate {
                FunctionKind::Aggregate
            } else {
                FunctionKind::Scalar
            };
            let definition =
                FunctionDefinition::new(name.as_str(), kind, returns, library.as_str());
            create(&args.db, &config, definition)
        }
        Command::Drop { ref name } => drop_function(&args.db, &config, name),
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var("UDFHOST_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "udfhost={level},udfctl={level}",
            level = default_level
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        // Human-readable format - clean and compact, on stderr so command
        // output stays parseable
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Config file (or defaults) plus environment, then command-line flags.
fn load_config(args: &Args) -> Result<UdfConfig> {
    let mut config = match &args.config {
        Some(path) => UdfConfig::load(path)?,
        None => UdfConfig::from_env().with_context(|| {
            format!(
                "invalid {} / {} environment",
                env_vars::PLUGIN_DIR,
                env_vars::ALLOW_SUSPICIOUS_BINDINGS
            )
        })?,
    };

    if let Some(dir) = &args.plugin_dir {
        config.plugin_dir = dir.clone();
    }
    if args.allow_suspicious {
        config.allow_suspicious_bindings = true;
    }
    Ok(config)
}

fn open_store(db: &Path) -> Result<FunctionStore> {
    FunctionStore::open(db).with_context(|| format!("Failed to open catalog {}", db.display()))
}

/// Catalog sync with every stored function loaded.
fn open_sync(db: &Path, config: &UdfConfig) -> Result<CatalogSync<FunctionStore>> {
    let store = open_store(db)?;
    let libraries = Arc::new(LibraryManager::dylib(config.plugin_dir.clone()));
    let sync = CatalogSync::new(store, libraries, config);
    sync.load_catalog()?;
    Ok(sync)
}

fn list(db: &Path) -> Result<()> {
    let store = open_store(db)?;
    let mut records = store.records()?;
    if records.is_empty() {
        println!("No functions registered.");
        return Ok(());
    }

    records.sort_by(|a, b| a.name.cmp(&b.name));
    println!("{:<24} {:<10} {:<8} {:<24} CREATED", "NAME", "KIND", "RETURNS", "LIBRARY");
    for record in records {
        let (kind, returns) = match record.to_definition() {
            Ok(def) => (def.kind.to_string(), def.return_type.to_string()),
            Err(_) => ("?".to_string(), "?".to_string()),
        };
        println!(
            "{:<24} {:<10} {:<8} {:<24} {}",
            record.name,
            kind,
            returns,
            record.dl,
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn check(db: &Path, config: &UdfConfig) -> Result<()> {
    let store = open_store(db)?;
    let libraries = Arc::new(LibraryManager::dylib(config.plugin_dir.clone()));
    let sync = CatalogSync::new(store, libraries, config);
    let report = sync.load_catalog()?;

    for name in &report.loaded {
        let descriptor = sync.registry().describe(name);
        if let Some(d) = &descriptor {
            debug!(function = %name, library = %d.library_path(), registered_at = %d.registered_at(), "Function loaded");
        }
        let suspicious = descriptor.map(|d| d.is_suspicious()).unwrap_or(false);
        if suspicious {
            println!("ok        {} (suspicious)", name);
        } else {
            println!("ok        {}", name);
        }
    }
    for name in &report.unusable {
        println!("unusable  {}", name);
    }
    for (name, error) in &report.skipped {
        println!("skipped   {}: {}", name, error);
    }
    println!(
        "{} loaded, {} unusable, {} skipped",
        report.loaded.len(),
        report.unusable.len(),
        report.skipped.len()
    );

    if !report.is_clean() {
        bail!(
            "{} of {} catalog rows could not be loaded",
            report.unusable.len() + report.skipped.len(),
            report.total()
        );
    }
    Ok(())
}

fn create(db: &Path, config: &UdfConfig, definition: FunctionDefinition) -> Result<()> {
    let sync = open_sync(db, config)?;
    let name = definition.name.clone();

    let mut txn = sync.catalog().begin()?;
    sync.create(&mut txn, definition)?;

    let suspicious = sync
        .registry()
        .describe(&name)
        .map(|d| d.is_suspicious())
        .unwrap_or(false);
    if suspicious {
        println!("Created function {} (no _init or _deinit exported)", name);
    } else {
        println!("Created function {}", name);
    }
    Ok(())
}

fn drop_function(db: &Path, config: &UdfConfig, name: &str) -> Result<()> {
    let sync = open_sync(db, config)?;

    let mut txn = sync.catalog().begin()?;
    sync.drop_function(&mut txn, name)?;

    println!("Dropped function {}", name);
    Ok(())
}
