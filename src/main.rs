use querymind::config::{LlmConfig, ReflectionConfig};
use querymind::execution::{BackingStore, FrameStore, SqliteStore};
use querymind::llm::LlmClient;
use querymind::{AssistantRun, SqlAssistant};

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "querymind")]
#[command(about = "Natural-language SQL assistant that reflects on and corrects its own queries")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs)]
struct SourceArgs {
    /// SQLite database file
    #[arg(long, default_value = "querymind.db", conflicts_with = "csv")]
    db: PathBuf,

    /// CSV file loaded in memory instead of a database
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Active table (or set QUERYMIND_TABLE env var)
    #[arg(long)]
    table: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question: generate SQL, run it, reflect, run the correction
    Ask {
        /// The question in natural language
        question: String,

        #[command(flatten)]
        source: SourceArgs,

        /// OpenAI API key (or set OPENAI_API_KEY env var)
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Print the schema of the active table
    Schema {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Ask {
            question,
            source,
            api_key,
        } => run_ask(question, source, api_key).await,
        Commands::Schema { source } => print_schema(source),
    }
}

fn open_source(source: &SourceArgs) -> Result<(Box<dyn BackingStore>, ReflectionConfig)> {
    let mut config = ReflectionConfig::from_env()?;
    if let Some(table) = &source.table {
        config = config.with_active_table(table.clone());
    }

    let store: Box<dyn BackingStore> = match &source.csv {
        Some(csv) => {
            info!("Loading {:?} as table {}", csv, config.active_table);
            Box::new(FrameStore::from_csv(config.active_table.clone(), csv)?)
        }
        None => Box::new(SqliteStore::open(&source.db)?),
    };
    Ok((store, config))
}

fn print_schema(source: SourceArgs) -> Result<()> {
    let (store, config) = open_source(&source)?;
    let schema = store.table_schema(&config.active_table)?;
    println!("{} ({} via {})", config.active_table, schema.columns().len(), store.name());
    println!("{}", schema);
    Ok(())
}

async fn run_ask(question: String, source: SourceArgs, api_key: Option<String>) -> Result<()> {
    let (store, config) = open_source(&source)?;

    let mut llm_config = LlmConfig::from_env();
    if let Some(key) = api_key {
        llm_config.api_key = key;
    }
    if llm_config.is_dummy() {
        info!("No API key configured, running with offline completions");
    }
    let llm = Arc::new(LlmClient::from_config(&llm_config));

    let mut assistant = SqlAssistant::new(llm, store, config);
    let run = assistant.ask(&question).await?;
    print_run(&run);

    let stats = assistant.engine().get_cache_stats();
    println!("\nCache: {}", serde_json::to_string(&stats)?);
    Ok(())
}

fn print_run(run: &AssistantRun) {
    println!("\n{}", "=".repeat(80));
    println!(" {}", run.question);
    println!("{}", "=".repeat(80));

    println!("\nGenerated SQL:\n  {}", run.initial_sql);
    println!("\nResult ({} rows):\n{}", run.initial_result.row_count(), run.initial_result.frame());

    println!("\nReflection:");
    for issue in &run.verdict.issues {
        println!("  - {}", issue);
    }
    println!("  Feedback: {}", run.verdict.feedback);
    println!("  Refined SQL: {}", run.verdict.refined_sql);
    println!("  Explanation: {}", run.verdict.explanation);

    if let Some(sql) = &run.refined_sql {
        println!("\nRefined SQL:\n  {}", sql);
        match (&run.refined_result, &run.refined_error) {
            (Some(result), _) => println!("\nRefined result ({} rows):\n{}", result.row_count(), result.frame()),
            (None, Some(error)) => println!("\nRefined query failed: {}", error),
            (None, None) => {}
        }
    }
}
