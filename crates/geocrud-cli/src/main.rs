//! Command-line interface for `geocrud`, permission-aware CRUD access to spatial datasets.
//!
//! This binary loads one dataset configuration (the JSON shape produced by the
//! permission layer), connects to its database and runs a single provider operation,
//! printing GeoJSON to standard output.
//!
//! # Architecture
//!
//! The CLI is built using [`clap`] for argument parsing and [`tracing`] for structured logging.
//! Library crates log through the `log` facade, which is bridged into `tracing` here.
//!
//! # Available Commands
//!
//! - `dialects` - List the supported SQL dialects and their capabilities
//! - `parse-filter` - Show the SQL a filter expression lowers to
//! - `index`, `show`, `create`, `update`, `delete`, `exists`, `extent`, `keyvals` -
//!   Feature operations against the configured dataset
//! - `validate` - Validate a feature payload without writing it

mod display;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{Level, debug, info};
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

use geocrud_core::bbox::{Bbox, parse_crs};
use geocrud_core::config::{DatasetConfig, DbHandles};
use geocrud_core::error::GeoCrudError;
use geocrud_core::feature::FeatureId;
use geocrud_core::filter::FilterParser;
use geocrud_core::i18n::{DefaultTranslator, Translator};
use geocrud_core::provider::{DatasetFeaturesProvider, IndexQuery};
use geocrud_core::spatial::create_dialect;
use geocrud_core_common::dialects::get_dialects;
use geocrud_core_common::{Database, find_dialect};
use geocrud_postgres::PostgresDatabase;

#[derive(Parser)]
#[command(
    name = "geocrud",
    version,
    about = "Permission-aware CRUD access to spatial datasets",
    long_about = "geocrud runs feature operations on one configured dataset: listing with\n\
                  filters and bounding boxes, reading, validated writes and deletes."
)]
/// Command-line arguments and options for the `geocrud` CLI.
///
/// Global flags select the dataset configuration, the database connection and the
/// logging verbosity; the subcommand selects the operation.
struct Cli {
    /// Enable verbose (INFO level) logging output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug (DEBUG level) logging output, including generated SQL.
    #[arg(short, long, global = true)]
    debug: bool,

    /// Dataset configuration file (JSON).
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Connection string of the read database.
    #[arg(long, global = true, env = "GEOCRUD_DSN", value_name = "DSN", hide_env_values = true)]
    dsn: Option<String>,

    /// Connection string of the write database; defaults to `--dsn`.
    #[arg(long, global = true, value_name = "DSN")]
    dsn_write: Option<String>,

    /// JSON file of message overrides (`{"key": "template"}`).
    #[arg(long, global = true, value_name = "FILE")]
    translations: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands for the `geocrud` CLI.
#[derive(Subcommand)]
enum Commands {
    /// Lists all known SQL dialects and their capabilities.
    Dialects,

    /// Parses a filter expression and prints the SQL it lowers to.
    ///
    /// Column names are checked against the attributes of `--config`.
    ParseFilter {
        /// Filter expression, e.g. '[["name", "=", "Oak"]]'.
        #[arg(value_name = "FILTER")]
        filter: String,
    },

    /// Lists features.
    Index {
        /// Bounding box 'minx,miny,maxx,maxy' in the output CRS.
        #[arg(long)]
        bbox: Option<String>,

        /// Output CRS, e.g. 'EPSG:4326'.
        #[arg(long)]
        crs: Option<String>,

        /// Filter expression.
        #[arg(long)]
        filter: Option<String>,

        /// GeoJSON geometry the features must intersect.
        #[arg(long, value_name = "GEOJSON")]
        filter_geom: Option<String>,

        /// Comma-separated attributes to return.
        #[arg(long, value_delimiter = ',')]
        fields: Option<Vec<String>>,

        /// Maximum number of features to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Number of matching features to skip.
        #[arg(long)]
        offset: Option<usize>,

        /// Sort keys, e.g. '-height,name'; '<id>' is the primary key.
        #[arg(long)]
        sort: Option<String>,

        /// Prints a table instead of GeoJSON.
        #[arg(long)]
        table: bool,
    },

    /// Shows one feature.
    Show {
        /// Feature id.
        id: String,

        /// Output CRS, e.g. 'EPSG:4326'.
        #[arg(long)]
        crs: Option<String>,

        /// Comma-separated attributes to return.
        #[arg(long, value_delimiter = ',')]
        fields: Option<Vec<String>>,
    },

    /// Validates and inserts a feature.
    Create {
        /// GeoJSON feature file, '-' for standard input.
        #[arg(value_name = "FEATURE")]
        feature: PathBuf,
    },

    /// Validates and updates a feature.
    Update {
        /// Feature id.
        id: String,

        /// GeoJSON feature file, '-' for standard input.
        #[arg(value_name = "FEATURE")]
        feature: PathBuf,
    },

    /// Deletes a feature.
    Delete {
        /// Feature id.
        id: String,
    },

    /// Prints whether a feature exists.
    Exists {
        /// Feature id.
        id: String,
    },

    /// Prints the extent of the matching features.
    Extent {
        /// Output CRS, e.g. 'EPSG:4326'.
        #[arg(long)]
        crs: Option<String>,

        /// Filter expression.
        #[arg(long)]
        filter: Option<String>,
    },

    /// Lists value/label pairs of two columns, ordered by label.
    Keyvals {
        /// Column holding the values.
        #[arg(long)]
        key: String,

        /// Column holding the labels.
        #[arg(long)]
        value: String,
    },

    /// Validates a feature payload without writing it.
    Validate {
        /// GeoJSON feature file, '-' for standard input.
        #[arg(value_name = "FEATURE")]
        feature: PathBuf,

        /// Validates as an update (geometry may be omitted).
        #[arg(long)]
        update: bool,
    },
}

/// Entry point for the `geocrud` command-line interface.
///
/// # Errors
///
/// Returns an error if command execution fails or if the logging system cannot be initialized.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    // Bridge logs from the `log` crate to the `tracing` ecosystem.
    LogTracer::init()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    run(&cli).await
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Dialects => {
            display::display_dialects(&get_dialects());
        },
        Commands::ParseFilter { filter } => {
            handle_parse_filter(cli, filter)?;
        },
        Commands::Index {
            bbox,
            crs,
            filter,
            filter_geom,
            fields,
            limit,
            offset,
            sort,
            table,
        } => {
            let mut query = IndexQuery::new();
            if let Some(bbox) = bbox {
                query = query.with_bbox(Bbox::parse(bbox).map_err(|e| describe(e.into()))?);
            }
            if let Some(srid) = parse_srid(crs.as_deref())? {
                query = query.with_srid(srid);
            }
            if let Some(filter) = filter {
                query = query.with_filter(filter.as_str());
            }
            if let Some(geometry) = filter_geom {
                let geometry: geojson::Geometry = serde_json::from_str(geometry)
                    .context("--filter-geom is not a GeoJSON geometry")?;
                query = query.with_filter_geom(geometry);
            }
            if let Some(fields) = fields {
                query = query.with_fields(fields.clone());
            }
            if let Some(limit) = limit {
                query = query.with_limit(*limit);
            }
            if let Some(offset) = offset {
                query = query.with_offset(*offset);
            }
            if let Some(sort) = sort {
                query = query.with_sort(sort.as_str());
            }

            let provider = open_provider(cli).await?;
            let collection = provider.index(&query).await.map_err(describe)?;
            info!(
                "{} of {} matching features",
                collection.number_returned, collection.number_matched
            );
            if *table {
                display::display_collection(&collection);
            } else {
                print_json(&collection)?;
            }
        },
        Commands::Show { id, crs, fields } => {
            let srid = parse_srid(crs.as_deref())?;
            let provider = open_provider(cli).await?;
            let feature = provider
                .show(&feature_id(id), srid, fields.as_deref())
                .await
                .map_err(describe)?;
            print_json(&feature)?;
        },
        Commands::Create { feature } => {
            let payload = read_payload(feature)?;
            let provider = open_provider(cli).await?;
            let created = provider.create(payload).await.map_err(describe)?;
            print_json(&created)?;
        },
        Commands::Update { id, feature } => {
            let payload = read_payload(feature)?;
            let provider = open_provider(cli).await?;
            let updated = provider
                .update(&feature_id(id), payload)
                .await
                .map_err(describe)?;
            print_json(&updated)?;
        },
        Commands::Delete { id } => {
            let provider = open_provider(cli).await?;
            if !provider.destroy(&feature_id(id)).await.map_err(describe)? {
                bail!("Feature '{id}' not found");
            }
            println!("Deleted feature {id}");
        },
        Commands::Exists { id } => {
            let provider = open_provider(cli).await?;
            println!("{}", provider.exists(&feature_id(id)).await.map_err(describe)?);
        },
        Commands::Extent { crs, filter } => {
            let srid = parse_srid(crs.as_deref())?;
            let provider = open_provider(cli).await?;
            match provider
                .extent(srid, filter.as_deref())
                .await
                .map_err(describe)?
            {
                Some(bbox) => println!("{}", display::bbox_text(&bbox)),
                None => println!("(no extent)"),
            }
        },
        Commands::Keyvals { key, value } => {
            let provider = open_provider(cli).await?;
            let options = provider.keyvals(key, value).await.map_err(describe)?;
            print_json(&options)?;
        },
        Commands::Validate { feature, update } => {
            let mut payload = read_payload(feature)?;
            let provider = open_provider(cli).await?;
            let report = provider
                .validate(&mut payload, !*update)
                .await
                .map_err(describe)?;
            display::display_report(&report);
            if !report.is_empty() {
                bail!("Feature validation failed");
            }
        },
    }
    Ok(())
}

fn handle_parse_filter(cli: &Cli, filter: &str) -> Result<()> {
    let config = load_config(cli)?;
    let dialect_kind = config.dialect().map_err(|e| describe(e.into()))?;
    let dialect = create_dialect(dialect_kind);
    let parsed = FilterParser::new(&config.primary_key, &config.attributes)
        .with_dialect(&*dialect)
        .parse(Some(filter))
        .map_err(|e| describe(e.into()))?;
    debug!("Parsed filter for {}.{}", config.schema, config.table_name);
    display::display_filter(&parsed);
    Ok(())
}

/// Turns a library error into a CLI error carrying the user message and hint.
fn describe(err: GeoCrudError) -> anyhow::Error {
    match err.recovery_suggestion() {
        Some(hint) => anyhow!("{}\nHint: {hint}", err.user_message()),
        None => anyhow!("{}", err.user_message()),
    }
}

fn load_config(cli: &Cli) -> Result<DatasetConfig> {
    let path = cli
        .config
        .as_deref()
        .ok_or_else(|| anyhow!("No dataset configuration given; pass --config <FILE>"))?;
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset configuration {}", path.display()))?;
    DatasetConfig::from_json_str(&json).map_err(|e| describe(e.into()))
}

fn load_translator(cli: &Cli) -> Result<Arc<dyn Translator>> {
    Ok(match &cli.translations {
        Some(path) => Arc::new(DefaultTranslator::from_file(path).map_err(|e| describe(e.into()))?),
        None => Arc::new(DefaultTranslator::new()),
    })
}

async fn open_provider(cli: &Cli) -> Result<DatasetFeaturesProvider> {
    let config = load_config(cli)?;

    let backend = find_dialect(&config.backend)
        .ok_or_else(|| anyhow!("Unknown backend '{}'", config.backend))?;
    if !backend.capabilities.backend.is_supported() {
        bail!(
            "Backend '{}' is not available in this build; only PostgreSQL ships a database driver",
            config.backend
        );
    }

    let dsn = cli.dsn.as_deref().ok_or_else(|| {
        anyhow!("No database connection given; pass --dsn or set GEOCRUD_DSN")
    })?;
    let read: Arc<dyn Database> = Arc::new(PostgresDatabase::from_dsn(dsn)?);
    let write: Arc<dyn Database> = match cli.dsn_write.as_deref() {
        Some(dsn) => Arc::new(PostgresDatabase::from_dsn(dsn)?),
        None => Arc::clone(&read),
    };

    info!("Opening dataset {}.{}", config.schema, config.table_name);
    DatasetFeaturesProvider::open(config, DbHandles::new(read, write), load_translator(cli)?)
        .await
        .map_err(describe)
}

fn parse_srid(crs: Option<&str>) -> Result<Option<i32>> {
    crs.map(parse_crs)
        .transpose()
        .map_err(|e| describe(e.into()))
}

fn feature_id(id: &str) -> FeatureId {
    id.parse().unwrap_or_else(|never: std::convert::Infallible| match never {})
}

fn read_payload(path: &Path) -> Result<Value> {
    let text = if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read feature from standard input")?;
        text
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("Failed to read feature {}", path.display()))?
    };
    serde_json::from_str(&text).context("Feature payload is not valid JSON")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_id_parsing() {
        assert_eq!(feature_id("12"), FeatureId::Int(12));
        assert_eq!(feature_id("a-12"), FeatureId::Str("a-12".to_string()));
    }

    #[test]
    fn test_parse_srid() -> Result<()> {
        assert_eq!(parse_srid(None)?, None);
        assert_eq!(parse_srid(Some("EPSG:2056"))?, Some(2056));
        let err = parse_srid(Some("WGS84")).unwrap_err();
        assert!(err.to_string().starts_with("Invalid request"));
        Ok(())
    }

    #[test]
    fn test_describe_adds_hint() {
        let err = describe(GeoCrudError::PermissionDenied {
            operation: geocrud_core::error::Operation::Delete,
        });
        let text = err.to_string();
        assert!(text.contains("not permitted"));
        assert!(text.contains("Hint: Check the dataset permissions"));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
