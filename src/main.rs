//! Cube CLI - inspect and maintain Cube databases

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cube::config::{self, Manifest, DEFAULT_AUTHORITY};
use cube::schema::generator::{drop_user_tables, user_tables, user_version};
use cube::schema::sql;
use cube::ui;
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cube")]
#[command(version = "0.0.1")]
#[command(about = "Inspect and maintain Cube databases")]
#[command(long_about = r#"
Cube maps Rust entities onto SQLite tables. This tool works on the
database file directly, without running the version lifecycle.

Example usage:
  cube init-manifest
  cube info --format json
  cube count notes --where "title LIKE 'a%'"
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the manifest (defaults to ./cube.toml)
    #[arg(short, long, global = true)]
    manifest: Option<PathBuf>,

    /// Database file, overriding the manifest
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version, journal mode and row counts
    Info {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List user tables
    Tables,

    /// Count rows in a table
    Count {
        /// Table name
        table: String,

        /// Optional filter clause, without WHERE
        #[arg(short = 'w', long = "where")]
        filter: Option<String>,
    },

    /// Write a starter manifest
    InitManifest {
        /// Overwrite an existing manifest
        #[arg(short, long)]
        force: bool,
    },

    /// Drop every user table
    Wipe,
}

#[derive(Serialize)]
struct DatabaseInfo {
    file: String,
    version: u32,
    journal_mode: String,
    tables: Vec<(String, i64)>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match &cli.command {
        Commands::InitManifest { force } => {
            let path = cli.manifest.clone().unwrap_or_else(config::default_manifest_path);
            let manifest = Manifest {
                authority: Some(DEFAULT_AUTHORITY.to_string()),
                version: Some(1),
                write_ahead_logging: Some(true),
                ..Manifest::default()
            };
            config::write_manifest(&path, &manifest, *force)?;
            ui::success(&format!("Wrote {}", path.display()));
        }

        Commands::Info { format } => {
            let (path, conn) = open(&cli)?;
            let info = DatabaseInfo {
                file: path.display().to_string(),
                version: user_version(&conn)?,
                journal_mode: conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?,
                tables: table_counts(&conn)?,
            };

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }

            ui::header("Cube database");
            ui::info("File", &info.file);
            ui::info("Version", &info.version.to_string());
            ui::info("Journal mode", &info.journal_mode);

            ui::section(" Tables ");
            if info.tables.is_empty() {
                ui::warn("No tables");
            } else {
                println!("{}", ui::tables_table(&info.tables));
            }
        }

        Commands::Tables => {
            let (_, conn) = open(&cli)?;
            for table in user_tables(&conn)? {
                println!("{}", table);
            }
        }

        Commands::Count { table, filter } => {
            let (_, conn) = open(&cli)?;
            if !user_tables(&conn)?.iter().any(|t| t.eq_ignore_ascii_case(table)) {
                bail!("no table named {}", table);
            }
            let query = sql::count(&sql::quote(table), filter.as_deref());
            let rows: i64 = conn
                .query_row(&query, [], |row| row.get(0))
                .with_context(|| format!("failed to run {}", query))?;
            println!("{}", rows);
        }

        Commands::Wipe => {
            let (path, conn) = open(&cli)?;
            let dropped = drop_user_tables(&conn, cli.verbose)?;
            ui::success(&format!("Dropped {} tables from {}", dropped, path.display()));
        }
    }

    Ok(())
}

/// Open the target database without touching its schema
fn open(cli: &Cli) -> anyhow::Result<(PathBuf, Connection)> {
    let path = resolve_database(cli.database.as_deref(), cli.manifest.as_deref())?;
    if !path.exists() {
        bail!("database {} does not exist", path.display());
    }
    let conn = Connection::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok((path, conn))
}

fn resolve_database(database: Option<&Path>, manifest: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(database) = database {
        return Ok(database.to_path_buf());
    }
    let manifest = config::load_manifest(manifest)?
        .context("no --database given and no manifest found (try `cube init-manifest`)")?;
    manifest
        .database_name()
        .map(PathBuf::from)
        .context("manifest names neither a database nor an authority")
}

fn table_counts(conn: &Connection) -> anyhow::Result<Vec<(String, i64)>> {
    let mut counts = Vec::new();
    for table in user_tables(conn)? {
        let rows: i64 = conn.query_row(&sql::count(&sql::quote(&table), None), [], |row| row.get(0))?;
        counts.push((table, rows));
    }
    Ok(counts)
}
