use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use schemax::core::dbml::LanguageDefinition;
use schemax::core::{Config, DatabaseType, DiagramSession, MemoryStorage};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "schemax", version, about = "DBML text <-> schema diagram compiler")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a schema file and print it back in canonical form
    Format {
        file: PathBuf,
        /// Dialect used to resolve types
        #[arg(long)]
        database_type: Option<DatabaseType>,
    },
    /// Reconcile a schema file into a diagram and print the diagram JSON
    Apply { diagram: PathBuf, file: PathBuf },
    /// Print the editor language definition as JSON
    Language {
        #[arg(long)]
        database_type: Option<DatabaseType>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load .env file (if exists)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    let args = Args::parse();

    match args.command {
        Command::Format {
            file,
            database_type,
        } => {
            let text = std::fs::read_to_string(&file)?;
            let mut session = DiagramSession::with_config(Arc::new(MemoryStorage::new()), &config);
            session
                .create_diagram("untitled", database_type.or(Some(config.database_type)))
                .await?;
            session.apply_schema_text(&text).await?;
            println!("{}", session.schema_text());
        }
        Command::Apply { diagram, file } => {
            let json = std::fs::read_to_string(&diagram)?;
            let text = std::fs::read_to_string(&file)?;

            let storage = Arc::new(MemoryStorage::new());
            let id = storage.import_json(&json)?;
            let mut session = DiagramSession::with_config(storage.clone(), &config);
            session.load_diagram(id).await?;

            let plan = session.apply_schema_text(&text).await?;
            tracing::info!("Applied {} mutations", plan.mutation_count());
            println!("{}", storage.export_json(id)?);
        }
        Command::Language { database_type } => {
            let language =
                LanguageDefinition::for_database(database_type.unwrap_or(config.database_type));
            println!("{}", serde_json::to_string_pretty(&language)?);
        }
    }

    Ok(())
}
