//! Divan command-line tool
//!
//! Database administration and document access against any server speaking
//! the CouchDB REST contract, plus an in-memory stand-in server.
//!
//! # Examples
//!
//! ```bash
//! # Start a local stand-in server with one database
//! divan serve --port 5984 --database proof_of_concept
//!
//! # Create a configured database and publish its views
//! divan --config divan.toml db create proof_of_concept
//! divan --config divan.toml views publish proof_of_concept
//!
//! # Look documents up through a model's views
//! divan --config divan.toml query viewed_model --by mod --value 0
//! ```

use clap::{Args, Parser, Subcommand};
use divan::server::{start_server, ServerConfig};
use divan::{Database, DatabaseConfig, DeleteAllOptions, DivanConfig, MemoryTransport, Registry};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Divan - object-document mapping for CouchDB-style databases
#[derive(Parser, Debug)]
#[command(name = "divan")]
#[command(version = divan::VERSION)]
#[command(about = "Divan - documents, revisions and views over a CouchDB-style REST API", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "DIVAN_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory; logs go to the console only when unset
    #[arg(long, global = true, env = "DIVAN_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the in-memory stand-in server
    Serve(ServeArgs),

    /// Database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// View operations
    Views {
        #[command(subcommand)]
        command: ViewCommands,
    },

    /// Raw document operations
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },

    /// List documents of a model, optionally through a `by_<attr>` view
    Query(QueryArgs),

    /// Delete documents of a model
    Purge {
        /// Model name
        model: String,
        /// Delete at most this many documents
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print the effective configuration
    Config,

    /// Show version
    Version,
}

/// Server arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// HTTP bind address
    #[arg(short, long, default_value = "127.0.0.1", env = "DIVAN_BIND")]
    bind: String,

    /// HTTP port
    #[arg(short, long, default_value = "5984", env = "DIVAN_PORT")]
    port: u16,

    /// Database to create at startup (repeatable)
    #[arg(short, long = "database")]
    databases: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Create a database
    Create { name: String },

    /// Drop a database
    Drop { name: String },

    /// Show database info
    Info { name: String },

    /// Exit status 0 when the database exists, 1 otherwise
    Exists { name: String },
}

#[derive(Subcommand, Debug)]
enum ViewCommands {
    /// Publish the design documents of every model stored in a database
    Publish { database: String },
}

#[derive(Subcommand, Debug)]
enum DocCommands {
    /// Print a document
    Get { database: String, id: String },

    /// Write a JSON document; the server assigns an id when none is given
    Put {
        database: String,
        /// Document body as JSON
        body: String,
        #[arg(long)]
        id: Option<String>,
    },

    /// Delete one revision of a document
    Delete {
        database: String,
        id: String,
        rev: String,
    },
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Model name
    model: String,

    /// Attribute with a declared view
    #[arg(long, requires = "value")]
    by: Option<String>,

    /// Value to match, as JSON (bare words are taken as strings)
    #[arg(long, requires = "by")]
    value: Option<String>,

    /// Maximum number of documents
    #[arg(short, long)]
    limit: Option<usize>,

    /// Print only the number of matches
    #[arg(long)]
    count: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    match cli.command {
        Commands::Serve(args) => serve_command(args).await,
        Commands::Version => {
            println!("Divan {}", divan::VERSION);
            Ok(())
        }
        command => {
            let config = DivanConfig::load(cli.config.as_deref())?;
            run(config, command).await
        }
    }
}

/// Setup console logging, plus daily rolling files when a directory is given
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "divan.log");
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Serve command - start the in-memory stand-in server
async fn serve_command(args: ServeArgs) -> anyhow::Result<()> {
    info!(version = %divan::VERSION, "Divan stand-in server starting");

    let config = ServerConfig {
        http_addr: args.bind,
        http_port: args.port,
        databases: args.databases,
    };
    start_server(config, MemoryTransport::new()).await
}

async fn run(config: DivanConfig, command: Commands) -> anyhow::Result<()> {
    let registry = Registry::builder(config.clone()).build()?;

    match command {
        Commands::Db { command } => db_command(&registry, command).await,
        Commands::Views {
            command: ViewCommands::Publish { database },
        } => {
            let acks = registry.create_views(&database).await?;
            for ack in acks {
                println!("{} {}", ack.id.unwrap_or_default(), ack.rev.unwrap_or_default());
            }
            Ok(())
        }
        Commands::Doc { command } => doc_command(&registry, command).await,
        Commands::Query(args) => query_command(&registry, args).await,
        Commands::Purge { model, limit } => {
            let model = registry.model(&model)?;
            let deleted = model.delete_all(DeleteAllOptions { limit }).await?;
            println!("Deleted {} document(s) of '{}'", deleted, model.name());
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Serve(_) | Commands::Version => Ok(()),
    }
}

/// A configured database, or one on the default server when unknown
fn database(registry: &Registry, name: &str) -> anyhow::Result<Arc<Database>> {
    match registry.database(name) {
        Ok(database) => Ok(database),
        Err(_) => {
            warn!(database = %name, "Database not configured, using default connection");
            Ok(Arc::new(Database::new(name, DatabaseConfig::default())?))
        }
    }
}

async fn db_command(registry: &Registry, command: DbCommands) -> anyhow::Result<()> {
    match command {
        DbCommands::Create { name } => {
            database(registry, &name)?.create().await?;
            println!("Database '{}' created", name);
        }
        DbCommands::Drop { name } => {
            database(registry, &name)?.delete().await?;
            println!("Database '{}' dropped", name);
        }
        DbCommands::Info { name } => {
            let stats = database(registry, &name)?.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        DbCommands::Exists { name } => {
            let exists = database(registry, &name)?.exists().await;
            println!("{}", exists);
            if !exists {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn doc_command(registry: &Registry, command: DocCommands) -> anyhow::Result<()> {
    match command {
        DocCommands::Get { database: name, id } => match database(registry, &name)?.get_document(&id).await? {
            Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
            None => anyhow::bail!("Document '{}' not found in '{}'", id, name),
        },
        DocCommands::Put {
            database: name,
            body,
            id,
        } => {
            let body: Value = serde_json::from_str(&body)?;
            let ack = database(registry, &name)?
                .save_document(id.as_deref(), body)
                .await?;
            println!("{}", serde_json::to_string(&ack)?);
        }
        DocCommands::Delete {
            database: name,
            id,
            rev,
        } => match database(registry, &name)?.delete_document(&id, &rev).await? {
            Some(ack) => println!("{}", serde_json::to_string(&ack)?),
            None => println!("Nothing to delete"),
        },
    }
    Ok(())
}

async fn query_command(registry: &Registry, args: QueryArgs) -> anyhow::Result<()> {
    let model = registry.model(&args.model)?;
    let mut query = match (&args.by, &args.value) {
        (Some(attribute), Some(raw)) => {
            let value = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.clone()));
            model.all_by(attribute, value)?
        }
        _ => model.all(),
    };
    if let Some(limit) = args.limit {
        query = query.limit(limit);
    }

    if args.count {
        println!("{}", query.count().await?);
        return Ok(());
    }
    for doc in query.fetch().await? {
        let line = serde_json::json!({
            "_id": doc.id(),
            "_rev": doc.rev(),
            "attributes": doc.attributes(),
        });
        println!("{}", line);
    }
    Ok(())
}
