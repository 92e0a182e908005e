//! DICOM indexer
//!
//! Command line front end for the extended query tag index: registers tags,
//! ingests DICOM JSON instances, runs reindex operations and shows the SQL
//! generated for a query.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use helios_dicom_index::backends::sqlite::SqliteIndexStore;
use helios_dicom_index::index::ExtendedTagIndexer;
use helios_dicom_index::orchestration::{LocalOrchestrationHost, OrchestrationThrottle};
use helios_dicom_index::query::{QueryParser, QueryRequest, QueryResource};
use helios_dicom_index::reindex::{
    ReindexActivities, ReindexInputAggregator, ReindexOrchestrator, ReindexService,
};
use helios_dicom_index::sql::{GeneratedQuery, SqlQueryGenerator};
use helios_dicom_index::store::{ExtendedTagRegistry, InstanceAttributes, InstanceStore};
use helios_dicom_index::tags::{AddExtendedQueryTagEntry, QueryTagLevel};
use serde_json::Value;
use tracing::{info, warn};

use config::IndexerConfig;

#[derive(Debug, Parser)]
#[command(name = "dicom-indexer")]
#[command(about = "DICOM extended query tag indexer")]
struct Cli {
    #[command(flatten)]
    config: IndexerConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register extended query tags (`PATH:VR:LEVEL[:CREATOR]`).
    AddTags {
        #[arg(required = true, value_parser = parse_tag)]
        tags: Vec<TagSpec>,
    },
    /// List registered extended query tags.
    ListTags,
    /// List validation errors recorded for a tag.
    Errors { key: i32 },
    /// Delete an extended query tag and its values.
    DeleteTag { key: i32 },
    /// Store DICOM JSON instances and index them against registered tags.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Index existing instances for tags in the Adding state.
    Reindex {
        #[arg(required = true, value_delimiter = ',')]
        keys: Vec<i32>,
    },
    /// Resume reindex operations interrupted by a previous run.
    Resume {
        /// Also resume failed operations from their last checkpoint.
        #[arg(long)]
        failed: bool,
        /// Resume these operations, whatever their status.
        #[arg(long = "operation")]
        operations: Vec<String>,
    },
    /// Print the SQL generated for a query.
    Explain {
        #[arg(long, value_enum, default_value = "studies")]
        resource: ResourceArg,
        #[arg(long)]
        study: Option<String>,
        #[arg(long)]
        series: Option<String>,
        /// Query parameter as `name=value`.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone)]
struct TagSpec {
    path: String,
    vr: String,
    level: QueryTagLevel,
    private_creator: Option<String>,
}

impl From<TagSpec> for AddExtendedQueryTagEntry {
    fn from(spec: TagSpec) -> Self {
        let entry = AddExtendedQueryTagEntry::new(spec.path, spec.vr, spec.level);
        match spec.private_creator {
            Some(creator) => entry.with_private_creator(creator),
            None => entry,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResourceArg {
    Studies,
    Series,
    Instances,
    StudySeries,
    StudyInstances,
    SeriesInstances,
}

impl From<ResourceArg> for QueryResource {
    fn from(resource: ResourceArg) -> Self {
        match resource {
            ResourceArg::Studies => QueryResource::AllStudies,
            ResourceArg::Series => QueryResource::AllSeries,
            ResourceArg::Instances => QueryResource::AllInstances,
            ResourceArg::StudySeries => QueryResource::StudySeries,
            ResourceArg::StudyInstances => QueryResource::StudyInstances,
            ResourceArg::SeriesInstances => QueryResource::StudySeriesInstances,
        }
    }
}

fn parse_tag(value: &str) -> Result<TagSpec, String> {
    let parts: Vec<&str> = value.split(':').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(format!("expected PATH:VR:LEVEL[:CREATOR], got '{}'", value));
    }
    let level = match parts[2].to_ascii_lowercase().as_str() {
        "study" => QueryTagLevel::Study,
        "series" => QueryTagLevel::Series,
        "instance" => QueryTagLevel::Instance,
        other => return Err(format!("unknown level '{}'", other)),
    };
    Ok(TagSpec {
        path: parts[0].to_string(),
        vr: parts[1].to_string(),
        level,
        private_creator: parts.get(3).map(|s| s.to_string()),
    })
}

fn parse_param(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", value))
}

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "helios_dicom_index={level},dicom_indexer={level}"
        ))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Opens the store and initializes its schema.
fn open_store(config: &IndexerConfig) -> anyhow::Result<Arc<SqliteIndexStore>> {
    info!(database = %config.database, "Opening index store");
    let store = SqliteIndexStore::with_config(&config.database, config.backend_config())?;
    store.init_schema()?;
    Ok(Arc::new(store))
}

/// Wires the reindex orchestrator, host and throttle over `store`.
fn reindex_service(
    store: &Arc<SqliteIndexStore>,
    config: &IndexerConfig,
) -> (LocalOrchestrationHost, ReindexService) {
    let indexer = ExtendedTagIndexer::new(store.clone(), store.clone());
    let activities = ReindexActivities::new(
        store.clone(),
        store.clone(),
        indexer,
        config.reindex_options(),
    );

    let host = LocalOrchestrationHost::new(store.clone());
    host.register(Arc::new(ReindexOrchestrator::new(Arc::new(activities))));
    let throttle = OrchestrationThrottle::spawn_with_aggregator(
        Arc::new(host.clone()),
        config.throttle_options(),
        Arc::new(ReindexInputAggregator),
    );
    let service = ReindexService::new(store.clone(), throttle, store.clone());
    (host, service)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Reads one instance or an array of instances from a DICOM JSON file.
fn read_instances(path: &Path) -> anyhow::Result<Vec<InstanceAttributes>> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| InstanceAttributes::from_json(item).map_err(anyhow::Error::from))
        .collect()
}

async fn ingest(store: &Arc<SqliteIndexStore>, files: &[PathBuf]) -> anyhow::Result<()> {
    let indexer = ExtendedTagIndexer::new(store.clone(), store.clone());
    let mut stored = 0usize;
    let mut failed = 0usize;

    for path in files {
        for attributes in read_instances(path)? {
            let identifier = store.add_instance(attributes).await?;
            let Some(instance) = store.fetch_instance_attributes(identifier.watermark).await?
            else {
                warn!(watermark = identifier.watermark, "Instance vanished before indexing");
                continue;
            };
            let report = indexer.index_new_instance(&instance).await?;
            for (key, code) in &report.errors {
                warn!(
                    sop_instance_uid = %identifier.sop_instance_uid,
                    tag_key = key,
                    error = %code,
                    "Extended query tag value rejected"
                );
            }
            failed += report.errors.len();
            stored += 1;
        }
        info!(file = %path.display(), "Ingested file");
    }

    info!(stored, rejected_values = failed, "Ingest finished");
    Ok(())
}

async fn reindex(
    store: &Arc<SqliteIndexStore>,
    config: &IndexerConfig,
    keys: &[i32],
) -> anyhow::Result<()> {
    let (host, service) = reindex_service(store, config);
    let resumed = host.resume_interrupted().await?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "Resumed interrupted operations");
    }

    let operation_id = service.start_reindex(keys).await?;
    info!(%operation_id, ?keys, "Started reindex");
    let status = service.wait_for_completion(operation_id).await?;
    info!(%operation_id, %status, "Reindex finished");

    print_json(&service.get_reindex_progress(operation_id).await?)?;
    for id in resumed {
        host.wait_for_completion(&id, config.poll_interval).await?;
    }
    Ok(())
}

async fn resume(
    store: &Arc<SqliteIndexStore>,
    config: &IndexerConfig,
    failed: bool,
    operations: &[String],
) -> anyhow::Result<()> {
    let (host, _service) = reindex_service(store, config);
    let mut resumed = host.resume_interrupted().await?;
    if failed {
        resumed.extend(host.resume_failed().await?);
    }
    for id in operations {
        if resumed.contains(id) {
            continue;
        }
        host.resume(id).await?;
        resumed.push(id.clone());
    }
    if resumed.is_empty() {
        info!("No operations to resume");
        return Ok(());
    }
    for id in resumed {
        let record = host.wait_for_completion(&id, config.poll_interval).await?;
        info!(instance_id = %id, status = %record.status, "Operation finished");
    }
    Ok(())
}

fn print_query(query: &GeneratedQuery) {
    println!("{}", query.sql);
    println!();
    for parameter in &query.parameters {
        println!("{} = {:?}", parameter.name, parameter.value);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config;
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }
    if config.is_memory() {
        warn!("Using an in-memory database; nothing is kept after exit");
    }

    let store = open_store(&config)?;

    match cli.command {
        Command::AddTags { tags } => {
            let entries: Vec<AddExtendedQueryTagEntry> =
                tags.into_iter().map(Into::into).collect();
            let added = store
                .add_extended_query_tags(&entries, config.max_tags)
                .await?;
            info!(count = added.len(), "Registered extended query tags");
            print_json(&added)?;
        }
        Command::ListTags => print_json(&store.list_all().await?)?,
        Command::Errors { key } => print_json(&store.get_errors(key).await?)?,
        Command::DeleteTag { key } => {
            store.delete_extended_query_tag(key).await?;
            info!(key, "Deleted extended query tag");
        }
        Command::Ingest { files } => ingest(&store, &files).await?,
        Command::Reindex { keys } => reindex(&store, &config, &keys).await?,
        Command::Resume { failed, operations } => {
            resume(&store, &config, failed, &operations).await?
        }
        Command::Explain {
            resource,
            study,
            series,
            params,
        } => {
            let mut request = QueryRequest::new(resource.into());
            request.partition_key = config.partition_key;
            if let Some(study) = study {
                request = request.with_study(study);
            }
            if let Some(series) = series {
                request = request.with_series(series);
            }
            for (name, value) in params {
                request = request.with_param(name, value);
            }

            let options = config.query_options();
            let tags = store.list_all().await?;
            let expression = QueryParser::new(&options, &tags).parse(&request)?;
            let query = SqlQueryGenerator::new(options.clone()).generate(&expression, tags.as_slice())?;
            print_query(&query);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_spec() {
        let spec = parse_tag("00101010:AS:study").unwrap();
        assert_eq!(spec.path, "00101010");
        assert_eq!(spec.level, QueryTagLevel::Study);
        assert!(spec.private_creator.is_none());

        let private = parse_tag("00091001:LO:Series:ACME").unwrap();
        assert_eq!(private.private_creator.as_deref(), Some("ACME"));

        assert!(parse_tag("00101010:AS").is_err());
        assert!(parse_tag("00101010:AS:patient").is_err());
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("Modality=CT").unwrap(),
            ("Modality".to_string(), "CT".to_string())
        );
        assert!(parse_param("Modality").is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::parse_from([
            "dicom-indexer",
            "--database",
            ":memory:",
            "reindex",
            "1,2",
        ]);
        assert!(matches!(cli.command, Command::Reindex { ref keys } if keys == &vec![1, 2]));

        let cli = Cli::parse_from(["dicom-indexer", "resume", "--failed", "--operation", "op-1"]);
        assert!(matches!(
            cli.command,
            Command::Resume { failed: true, ref operations } if operations == &vec!["op-1".to_string()]
        ));
        let cli = Cli::parse_from(["dicom-indexer", "resume"]);
        assert!(matches!(cli.command, Command::Resume { failed: false, ref operations } if operations.is_empty()));

        let cli = Cli::parse_from([
            "dicom-indexer",
            "explain",
            "--resource",
            "study-instances",
            "--study",
            "1.2",
            "--param",
            "Modality=CT",
        ]);
        assert!(matches!(
            cli.command,
            Command::Explain {
                resource: ResourceArg::StudyInstances,
                ..
            }
        ));
    }
}
