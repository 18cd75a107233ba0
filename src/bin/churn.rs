//! churn CLI - Command-line interface for churn-tracker
//!
//! Commands:
//! - ingest: Apply tracking events to a store and recompute metrics
//! - recompute: Recompute metrics for one user or every known user
//! - show: Print a user's metrics and feature usage, or one feature's analytics
//! - doctor: Diagnose store and configuration health

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use churn_tracker::{
    AggregatorConfig, BehavioralMetrics, ChurnError, FeatureUsage, InMemoryEventStore,
    MetricsAggregator, Tracker, TrackingEvent, PRODUCER_NAME, TRACKER_VERSION,
};

/// churn - Behavioral metrics for user analytics and churn tracking
#[derive(Parser)]
#[command(name = "churn")]
#[command(version = TRACKER_VERSION)]
#[command(about = "Track user activity and derive behavioral churn metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply tracking events to a store and recompute metrics
    Ingest {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Store file (created if missing)
        #[arg(short, long)]
        store: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Aggregator config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Skip invalid events instead of aborting
        #[arg(long)]
        skip_invalid: bool,

        /// Reference time (RFC 3339) for missing timestamps and recomputation
        #[arg(long)]
        now: Option<String>,
    },

    /// Recompute metrics for one user or every known user
    Recompute {
        /// Store file
        #[arg(short, long)]
        store: PathBuf,

        /// User to recompute (all known users if omitted)
        #[arg(short, long)]
        user: Option<String>,

        /// Reference time (RFC 3339), defaults to now
        #[arg(long)]
        now: Option<String>,

        /// Aggregator config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,
    },

    /// Print a user's stored metrics and feature usage, or one feature's analytics
    Show {
        /// Store file
        #[arg(short, long)]
        store: PathBuf,

        /// User id
        #[arg(short, long, required_unless_present = "feature", conflicts_with = "feature")]
        user: Option<String>,

        /// Feature name, across all users
        #[arg(short, long)]
        feature: Option<String>,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,
    },

    /// Diagnose store and configuration health
    Doctor {
        /// Store file to check
        #[arg(long)]
        store: Option<PathBuf>,

        /// Config file to check
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one record per line)
    Ndjson,
    /// JSON array of records
    Json,
    /// Pretty-printed JSON, a lone record is printed without the array
    JsonPretty,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let line = serde_json::to_string(&CliError::from(&e))
                .unwrap_or_else(|_| format!("{{\"code\":\"{}\"}}", e.code()));
            eprintln!("{}", line);
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr so stdout stays machine readable. Level comes from RUST_LOG.
fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

fn run(cli: Cli) -> Result<(), ChurnCliError> {
    match cli.command {
        Commands::Ingest {
            input,
            store,
            input_format,
            config,
            skip_invalid,
            now,
        } => cmd_ingest(
            &input,
            &store,
            input_format,
            config.as_deref(),
            skip_invalid,
            now.as_deref(),
        ),

        Commands::Recompute {
            store,
            user,
            now,
            config,
            output_format,
        } => cmd_recompute(
            &store,
            user.as_deref(),
            now.as_deref(),
            config.as_deref(),
            output_format,
        ),

        Commands::Show {
            store,
            user,
            feature,
            output_format,
        } => cmd_show(&store, user.as_deref(), feature.as_deref(), output_format),

        Commands::Doctor { store, config, json } => {
            cmd_doctor(store.as_deref(), config.as_deref(), json)
        }
    }
}

fn cmd_ingest(
    input: &Path,
    store_path: &Path,
    input_format: InputFormat,
    config: Option<&Path>,
    skip_invalid: bool,
    now: Option<&str>,
) -> Result<(), ChurnCliError> {
    let now = parse_now(now)?;
    let input_data = read_input(input)?;
    let events = match input_format {
        InputFormat::Ndjson => parse_ndjson(&input_data)?,
        InputFormat::Json => serde_json::from_str::<Vec<TrackingEvent>>(&input_data)?,
    };

    if events.is_empty() {
        return Err(ChurnCliError::NoEvents);
    }

    let store = Arc::new(InMemoryEventStore::open(store_path)?);
    let tracker = Tracker::with_config(store.clone(), load_config(config)?)?;

    let mut report = IngestReport::default();
    for (index, event) in events.into_iter().enumerate() {
        let kind = event.kind();
        match tracker.apply_at(event, now) {
            Ok(outcome) => {
                report.applied += 1;
                if outcome.metrics_stale() {
                    report.stale_metrics += 1;
                }
            }
            Err(ChurnError::InvalidInput(msg)) if skip_invalid => {
                tracing::warn!(index, kind, "skipping invalid event: {}", msg);
                report.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    store.save(store_path)?;
    tracing::info!(applied = report.applied, skipped = report.skipped, "ingest complete");

    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn cmd_recompute(
    store_path: &Path,
    user: Option<&str>,
    now: Option<&str>,
    config: Option<&Path>,
    output_format: OutputFormat,
) -> Result<(), ChurnCliError> {
    let now = parse_now(now)?;

    let store = Arc::new(InMemoryEventStore::load(store_path)?);
    let aggregator = MetricsAggregator::with_config(store.clone(), load_config(config)?)?;

    let user_ids = match user {
        Some(id) => vec![id.to_string()],
        None => store.known_user_ids()?,
    };

    let mut results: Vec<BehavioralMetrics> = Vec::with_capacity(user_ids.len());
    for user_id in &user_ids {
        results.push(aggregator.recompute_at(user_id, now)?);
    }

    store.save(store_path)?;

    print!("{}", render(&results, &output_format)?);
    Ok(())
}

fn cmd_show(
    store_path: &Path,
    user: Option<&str>,
    feature: Option<&str>,
    output_format: OutputFormat,
) -> Result<(), ChurnCliError> {
    let store = Arc::new(InMemoryEventStore::load(store_path)?);
    let tracker = Tracker::new(store);

    let rendered = match (user, feature) {
        (Some(user_id), _) => {
            let metrics = tracker
                .metrics(user_id)?
                .ok_or_else(|| ChurnCliError::NoMetrics(user_id.to_string()))?;
            let report = UserReport {
                metrics,
                feature_usage: tracker.feature_usage(user_id)?,
            };
            render(&[report], &output_format)?
        }
        (None, Some(name)) => render(&[tracker.feature_analytics(name)?], &output_format)?,
        // clap requires one of the two
        (None, None) => return Err(ChurnCliError::ParseError("--user or --feature".to_string())),
    };

    print!("{}", rendered);
    Ok(())
}

fn cmd_doctor(
    store: Option<&Path>,
    config: Option<&Path>,
    json: bool,
) -> Result<(), ChurnCliError> {
    let mut checks = vec![DoctorCheck::ok(
        "version",
        format!("{} {}", PRODUCER_NAME, TRACKER_VERSION),
    )];

    if let Some(config_path) = config {
        checks.push(DoctorCheck::from_result(
            "config",
            AggregatorConfig::load(config_path),
            |_| format!("{} is valid", config_path.display()),
        ));
    }

    if let Some(store_path) = store {
        if store_path.exists() {
            checks.push(DoctorCheck::from_result(
                "store",
                InMemoryEventStore::load(store_path).and_then(|s| s.stats()),
                |stats| {
                    format!(
                        "{} users, {} sessions, {} feature events, {} metrics records",
                        stats.users, stats.sessions, stats.feature_events, stats.metrics_records
                    )
                },
            ));
        } else {
            checks.push(DoctorCheck {
                name: "store",
                status: CheckStatus::Warning,
                message: format!("{} not found, ingest will create it", store_path.display()),
            });
        }
    }

    let failed = checks.iter().any(|c| c.status == CheckStatus::Error);
    let report = DoctorReport {
        producer: PRODUCER_NAME,
        version: TRACKER_VERSION,
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} {}", report.producer, report.version);
        for check in &report.checks {
            println!("{:<8} {:<8} {}", check.status.label(), check.name, check.message);
        }
    }

    if failed {
        Err(ChurnCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn parse_now(raw: Option<&str>) -> Result<DateTime<Utc>, ChurnCliError> {
    match raw {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ChurnCliError::ParseError(format!("Invalid --now {}: {}", raw, e))),
        None => Ok(Utc::now()),
    }
}

fn read_input(input: &Path) -> Result<String, ChurnCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn parse_ndjson(data: &str) -> Result<Vec<TrackingEvent>, ChurnCliError> {
    let mut events = Vec::new();
    for (line_no, line) in data.as_bytes().lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: TrackingEvent = serde_json::from_str(trimmed).map_err(|e| {
            ChurnCliError::ParseError(format!("line {}: {}", line_no + 1, e))
        })?;
        events.push(event);
    }
    Ok(events)
}

fn load_config(path: Option<&Path>) -> Result<AggregatorConfig, ChurnCliError> {
    match path {
        Some(path) => Ok(AggregatorConfig::load(path)?),
        None => Ok(AggregatorConfig::default()),
    }
}

/// Serialize records in the requested layout, newline terminated
fn render<T: Serialize>(records: &[T], format: &OutputFormat) -> Result<String, ChurnCliError> {
    let body = match format {
        OutputFormat::Ndjson => records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?
            .join("\n"),
        OutputFormat::Json => serde_json::to_string(records)?,
        OutputFormat::JsonPretty if records.len() == 1 => {
            serde_json::to_string_pretty(&records[0])?
        }
        OutputFormat::JsonPretty => serde_json::to_string_pretty(records)?,
    };
    Ok(body + "\n")
}

#[derive(Debug)]
enum ChurnCliError {
    Io(io::Error),
    Tracker(ChurnError),
    Json(serde_json::Error),
    NoEvents,
    NoMetrics(String),
    DoctorFailed,
    ParseError(String),
}

impl ChurnCliError {
    fn code(&self) -> &'static str {
        match self {
            ChurnCliError::Io(_) => "IO_ERROR",
            ChurnCliError::Tracker(ChurnError::DataAccess(_)) => "DATA_ACCESS_ERROR",
            ChurnCliError::Tracker(ChurnError::InvalidInput(_)) => "INVALID_INPUT",
            ChurnCliError::Tracker(ChurnError::Config(_)) => "CONFIG_ERROR",
            ChurnCliError::Tracker(ChurnError::JsonError(_)) | ChurnCliError::Json(_) => {
                "JSON_ERROR"
            }
            ChurnCliError::NoEvents => "NO_EVENTS",
            ChurnCliError::NoMetrics(_) => "NO_METRICS",
            ChurnCliError::DoctorFailed => "DOCTOR_FAILED",
            ChurnCliError::ParseError(_) => "PARSE_ERROR",
        }
    }

    fn hint(&self) -> Option<&'static str> {
        let hint = match self {
            ChurnCliError::Io(_) => "Check file paths and permissions",
            ChurnCliError::Tracker(ChurnError::DataAccess(_)) => {
                "Check the store file with 'churn doctor'"
            }
            ChurnCliError::Tracker(ChurnError::InvalidInput(_)) => {
                "Fix the event or rerun with --skip-invalid"
            }
            ChurnCliError::Tracker(ChurnError::Config(_)) => "Check the config file",
            ChurnCliError::NoMetrics(_) => "Run 'churn recompute' for this user first",
            ChurnCliError::ParseError(_) => "Each line must be a session, feature or user event",
            _ => return None,
        };
        Some(hint)
    }
}

impl std::fmt::Display for ChurnCliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChurnCliError::Io(e) => write!(f, "{}", e),
            ChurnCliError::Tracker(e) => write!(f, "{}", e),
            ChurnCliError::Json(e) => write!(f, "{}", e),
            ChurnCliError::NoEvents => write!(f, "No events found in input"),
            ChurnCliError::NoMetrics(user) => write!(f, "No metrics stored for user {}", user),
            ChurnCliError::DoctorFailed => write!(f, "One or more health checks failed"),
            ChurnCliError::ParseError(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<io::Error> for ChurnCliError {
    fn from(e: io::Error) -> Self {
        ChurnCliError::Io(e)
    }
}

impl From<ChurnError> for ChurnCliError {
    fn from(e: ChurnError) -> Self {
        ChurnCliError::Tracker(e)
    }
}

impl From<serde_json::Error> for ChurnCliError {
    fn from(e: serde_json::Error) -> Self {
        ChurnCliError::Json(e)
    }
}

/// Error line written to stderr
#[derive(Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
}

impl From<&ChurnCliError> for CliError {
    fn from(e: &ChurnCliError) -> Self {
        CliError {
            code: e.code(),
            message: e.to_string(),
            hint: e.hint(),
        }
    }
}

#[derive(Default, Serialize)]
struct IngestReport {
    applied: usize,
    skipped: usize,
    stale_metrics: usize,
}

#[derive(Serialize)]
struct UserReport {
    metrics: BehavioralMetrics,
    feature_usage: Vec<FeatureUsage>,
}

#[derive(Serialize)]
struct DoctorReport {
    producer: &'static str,
    version: &'static str,
    checks: Vec<DoctorCheck>,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    message: String,
}

impl DoctorCheck {
    fn ok(name: &'static str, message: String) -> Self {
        DoctorCheck {
            name,
            status: CheckStatus::Ok,
            message,
        }
    }

    fn from_result<T>(
        name: &'static str,
        result: Result<T, ChurnError>,
        describe: impl FnOnce(T) -> String,
    ) -> Self {
        match result {
            Ok(value) => DoctorCheck::ok(name, describe(value)),
            Err(e) => DoctorCheck {
                name,
                status: CheckStatus::Error,
                message: e.to_string(),
            },
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl CheckStatus {
    fn label(self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warning => "warning",
            CheckStatus::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        id: u32,
    }

    #[test]
    fn test_render_layouts() {
        let rows = [Row { id: 1 }, Row { id: 2 }];
        assert_eq!(render(&rows, &OutputFormat::Ndjson).unwrap(), "{\"id\":1}\n{\"id\":2}\n");
        assert_eq!(render(&rows, &OutputFormat::Json).unwrap(), "[{\"id\":1},{\"id\":2}]\n");
        assert_eq!(
            render(&rows[..1], &OutputFormat::JsonPretty).unwrap(),
            "{\n  \"id\": 1\n}\n"
        );
    }

    #[test]
    fn test_corrupt_store_maps_to_data_access_code() {
        let err = match InMemoryEventStore::from_json("not json") {
            Err(e) => ChurnCliError::from(e),
            Ok(_) => panic!("corrupt snapshot accepted"),
        };
        let rendered = CliError::from(&err);

        assert_eq!(rendered.code, "DATA_ACCESS_ERROR");
        assert_eq!(rendered.hint, Some("Check the store file with 'churn doctor'"));
    }

    #[test]
    fn test_doctor_check_from_result() {
        let ok = DoctorCheck::from_result("store", Ok(3), |n| format!("{} users", n));
        assert!(ok.status == CheckStatus::Ok);
        assert_eq!(ok.message, "3 users");

        let failed = DoctorCheck::from_result(
            "config",
            Err::<(), _>(ChurnError::Config("weights".to_string())),
            |_| String::new(),
        );
        assert!(failed.status == CheckStatus::Error);
        assert_eq!(failed.status.label(), "error");
    }
}
