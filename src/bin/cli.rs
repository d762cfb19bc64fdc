use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use estate_rag::generator::{area_guides, PropertyGenerator};
use estate_rag::property::quality_score;
use estate_rag::{Config, Error, EstateRag, Property, Result, SearchMode, SearchParams};

/// Listings scoring below this are reported by `quality`.
const LOW_QUALITY_THRESHOLD: f64 = 0.5;

/// Dubai real-estate RAG command line interface
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ESTATE_RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output format (json, pretty, plain)
    #[arg(long, default_value = "pretty")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone)]
enum OutputFormat {
    Json,
    Pretty,
    Plain,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "pretty" => Ok(OutputFormat::Pretty),
            "plain" => Ok(OutputFormat::Plain),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate synthetic Dubai listings
    Generate(GenerateArgs),
    /// Ingest a JSON listings file into both backends
    Ingest(IngestArgs),
    /// Run a search against the configured backends
    Search(SearchArgs),
    /// Score the data quality of a listings file
    Quality(QualityArgs),
    /// Configuration management
    Config(ConfigArgs),
}

#[derive(Args)]
struct GenerateArgs {
    /// Number of listings
    #[arg(short = 'n', long, default_value = "100")]
    count: usize,

    /// RNG seed; the same seed yields the same listings
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Write listings here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also write per-area market guides to this file
    #[arg(long)]
    guides: Option<PathBuf>,
}

#[derive(Args)]
struct IngestArgs {
    /// JSON array of listings
    file: PathBuf,

    /// Also ingest the built-in area market guides as documents
    #[arg(long)]
    guides: bool,
}

#[derive(Args)]
struct SearchArgs {
    /// Free-text query
    #[arg(default_value = "")]
    query: String,

    /// vector, structured or hybrid
    #[arg(short, long, default_value = "hybrid")]
    mode: SearchMode,

    #[arg(long)]
    location: Option<String>,

    #[arg(long = "type")]
    property_type: Option<String>,

    #[arg(long)]
    min_price: Option<f64>,

    #[arg(long)]
    max_price: Option<f64>,

    #[arg(long)]
    bedrooms: Option<i32>,

    /// Maximum number of results
    #[arg(short, long, default_value = "10")]
    limit: usize,
}

#[derive(Args)]
struct QualityArgs {
    /// JSON array of listings
    file: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate configuration
    Validate,
    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "estate-rag.json")]
        output: PathBuf,
    },
    /// Hash a password for an `auth.users` entry
    HashPassword {
        /// Plain-text password
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("estate_rag={level},estate_rag_cli={level}", level = log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(cli.config.as_deref())?;

    // Commands that never touch the backends.
    let result = match &cli.command {
        Commands::Config(args) => return handle_config_command(args, &config, &cli.output),
        Commands::Generate(args) => Some(handle_generate(args)),
        Commands::Quality(args) => Some(handle_quality(args)),
        _ => None,
    };

    let result = match result {
        Some(result) => result,
        None => {
            let rag = EstateRag::new(config).await?;
            info!("Services initialized");
            match cli.command {
                Commands::Ingest(args) => handle_ingest(&rag, args).await,
                Commands::Search(args) => handle_search(&rag, args).await,
                _ => unreachable!("handled above"),
            }
        }
    };

    match result {
        Ok(output) => {
            print_output(&output, &cli.output);
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::from_file(&path.to_path_buf())
        }
        None => {
            warn!("No configuration file specified, using environment and defaults");
            Ok(Config::default())
        }
    }
}

fn read_listings(path: &Path) -> Result<Vec<Property>> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::InvalidInput(format!("{} is not a JSON array of listings: {}", path.display(), e)))
}

fn handle_config_command(args: &ConfigArgs, config: &Config, output_format: &OutputFormat) -> Result<()> {
    match &args.action {
        ConfigAction::Show => {
            print_output(&json!({ "config": config }), output_format);
        }
        ConfigAction::Validate => match config.validate() {
            Ok(()) => {
                let output = json!({
                    "status": "valid",
                    "message": "Configuration is valid"
                });
                print_output(&output, output_format);
            }
            Err(e) => {
                let output = json!({
                    "status": "invalid",
                    "error": e.to_string()
                });
                print_output(&output, output_format);
                return Err(e);
            }
        },
        ConfigAction::Generate { output: output_path } => {
            let config_json = serde_json::to_string_pretty(&Config::default())?;
            std::fs::write(output_path, config_json)?;
            let output = json!({
                "status": "generated",
                "file": output_path.to_string_lossy(),
                "message": "Default configuration file generated"
            });
            print_output(&output, output_format);
        }
        ConfigAction::HashPassword { password } => {
            let hash = estate_rag::auth::hash_password(password)?;
            print_output(&json!({ "password_hash": hash }), output_format);
        }
    }
    Ok(())
}

fn handle_generate(args: &GenerateArgs) -> Result<Value> {
    if args.count == 0 {
        return Err(Error::InvalidInput("count must be > 0".to_string()));
    }
    let listings = PropertyGenerator::new(args.seed).generate(args.count);

    let Some(path) = &args.output else {
        // Listings go to stdout as-is so they can be piped into a file.
        return Ok(serde_json::to_value(&listings)?);
    };
    std::fs::write(path, serde_json::to_string_pretty(&listings)?)?;
    info!(count = listings.len(), file = %path.display(), "listings generated");

    let mut output = json!({
        "status": "generated",
        "count": listings.len(),
        "seed": args.seed,
        "file": path.to_string_lossy(),
    });
    if let Some(guides_path) = &args.guides {
        let guides: Vec<Value> = area_guides()
            .into_iter()
            .map(|(content, metadata)| json!({ "content": content, "metadata": metadata }))
            .collect();
        std::fs::write(guides_path, serde_json::to_string_pretty(&guides)?)?;
        output["guides"] = json!(guides_path.to_string_lossy());
        output["guide_count"] = json!(guides.len());
    }
    Ok(output)
}

fn handle_quality(args: &QualityArgs) -> Result<Value> {
    let listings = read_listings(&args.file)?;
    if listings.is_empty() {
        return Err(Error::InvalidInput("listings file is empty".to_string()));
    }
    let scored: Vec<(&Property, f64)> = listings.iter().map(|p| (p, quality_score(p))).collect();
    let total: f64 = scored.iter().map(|(_, s)| s).sum();
    let min = scored.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = scored.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    let low: Vec<Value> = scored
        .iter()
        .filter(|(_, s)| *s < LOW_QUALITY_THRESHOLD)
        .map(|(p, s)| json!({ "id": p.id, "title": p.title, "score": s }))
        .collect();

    Ok(json!({
        "listings": listings.len(),
        "average_score": total / listings.len() as f64,
        "min_score": min,
        "max_score": max,
        "low_quality_threshold": LOW_QUALITY_THRESHOLD,
        "low_quality": low,
    }))
}

async fn handle_ingest(rag: &EstateRag, args: IngestArgs) -> Result<Value> {
    let listings = read_listings(&args.file)?;
    info!(count = listings.len(), file = %args.file.display(), "ingesting listings");
    let report = rag.knowledge.ingest_properties(listings).await?;

    let mut documents = 0;
    if args.guides {
        for (content, metadata) in area_guides() {
            match rag.knowledge.ingest_document(&content, metadata).await {
                Ok(_) => documents += 1,
                Err(e) => warn!("Failed to ingest area guide: {}", e),
            }
        }
    }

    Ok(json!({
        "status": "success",
        "ingested": report.ingested,
        "rejected": report.rejected,
        "guides_ingested": documents,
        "timestamp": chrono::Utc::now(),
    }))
}

async fn handle_search(rag: &EstateRag, args: SearchArgs) -> Result<Value> {
    let params = SearchParams {
        query: args.query,
        mode: args.mode,
        location: args.location,
        property_type: args.property_type,
        min_price: args.min_price,
        max_price: args.max_price,
        bedrooms: args.bedrooms,
        limit: Some(args.limit),
    };
    let response = rag.engine.search(params).await?;
    Ok(serde_json::to_value(&response)?)
}

fn print_output(output: &Value, format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(output).unwrap_or_default());
        }
        OutputFormat::Pretty => {
            println!("{}", serde_json::to_string_pretty(output).unwrap_or_default());
        }
        OutputFormat::Plain => {
            if let Some(obj) = output.as_object() {
                for (key, value) in obj {
                    match value {
                        Value::String(s) => println!("{}: {}", key, s),
                        _ => println!("{}: {}", key, value),
                    }
                }
            } else {
                println!("{}", output);
            }
        }
    }
}
