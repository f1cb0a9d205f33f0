//! detect-worker — scheduled rule execution over a file-backed setup.
//!
//! Loads rule definitions from a directory of JSON files, scans a JSONL
//! event file, and appends detections to per-destination JSONL feeds.
//! Execution state (watermarks, partial progress, history) lives in a
//! single JSON state file. Rules are reloaded every cycle, so edits to
//! the rules directory take effect without a restart.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use argus_core::{Detection, FieldValue, FieldValueRow};
use argus_dedup::{DuplicateCheckDirs, DuplicateCheckStore};
use argus_detect::{
    load_dotenv, DetectConfig, DetectError, DetectionPipeline, DetectionSink, EventSource,
    ExecutionRecord, ExecutionTracker, ExecutionWindow, FieldEqualsPredicate, NotificationConfig,
    OutputColumn, Rule, SourceState, Throttle, ThrottlePolicy, ThrottleRegistry,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Argus detect worker — scheduled rule evaluation and alerting.
#[derive(Parser, Debug)]
#[command(name = "detect-worker", version, about)]
struct Cli {
    /// Run a single execution cycle and exit.
    #[arg(long)]
    once: bool,

    /// Seconds between execution cycles (overrides ARGUS_INTERVAL_SECS).
    #[arg(long, env = "ARGUS_INTERVAL_SECS")]
    interval_secs: Option<u64>,
}

// ── Rule files ──────────────────────────────────────────────────────

/// On-disk rule definition, one JSON file per rule.
#[derive(Debug, Deserialize)]
struct RuleFile {
    uuid: Uuid,
    name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    description: Option<String>,
    filter: FilterFile,
    columns: Vec<ColumnFile>,
    destination: Option<String>,
    #[serde(default)]
    max_notifications: Option<u64>,
    #[serde(default)]
    resume_after_secs: Option<i64>,
    #[serde(default)]
    wait_for_data_secs: i64,
    #[serde(default)]
    min_time: Option<DateTime<Utc>>,
    #[serde(default)]
    max_time: Option<DateTime<Utc>>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Deserialize)]
struct FilterFile {
    field: String,
    equals: FieldValue,
}

#[derive(Debug, Deserialize)]
struct ColumnFile {
    name: String,
    #[serde(default)]
    source_field: Option<String>,
    #[serde(default)]
    grouped: bool,
}

impl RuleFile {
    fn into_rule(self) -> Rule {
        Rule {
            uuid: self.uuid,
            name: self.name,
            version: self.version,
            description: self.description,
            predicate: Arc::new(FieldEqualsPredicate {
                field: self.filter.field,
                value: self.filter.equals,
            }),
            columns: self
                .columns
                .into_iter()
                .map(|c| {
                    let source = c.source_field.unwrap_or_else(|| c.name.clone());
                    OutputColumn::new(c.name, source, c.grouped)
                })
                .collect(),
            notification: NotificationConfig {
                destination: self.destination,
                policy: ThrottlePolicy {
                    max_notifications: self.max_notifications,
                    resume_after: self.resume_after_secs.map(Duration::seconds),
                },
            },
            min_time: self.min_time,
            max_time: self.max_time,
            wait_for_data: Duration::seconds(self.wait_for_data_secs),
        }
    }
}

/// Load every parseable rule file from the rules directory. Files that do
/// not parse are logged and skipped so one bad rule cannot take the worker
/// down.
fn load_rules(rules_dir: &Path) -> Vec<Rule> {
    let entries = match fs::read_dir(rules_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %rules_dir.display(), error = %e, "cannot read rules directory");
            return Vec::new();
        }
    };

    let mut rules = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<RuleFile>(&text).map_err(|e| e.to_string()));
        match parsed {
            Ok(file) => rules.push(file.into_rule()),
            Err(e) => warn!(file = %path.display(), error = %e, "skipping unparseable rule file"),
        }
    }
    rules.sort_by_key(|r| r.uuid);
    rules
}

// ── Event source ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EventRecord {
    time: DateTime<Utc>,
    fields: IndexMap<String, FieldValue>,
}

/// Reads a JSONL event file. A file is always "up to date": whatever is in
/// it is everything there is.
struct JsonlEventSource {
    path: PathBuf,
}

impl JsonlEventSource {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_records(&self) -> Result<Vec<EventRecord>, DetectError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DetectError::Source(e.to_string())),
        };
        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| DetectError::Source(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = serde_json::from_str(&line).map_err(|e| {
                DetectError::Source(format!(
                    "{} line {}: {}",
                    self.path.display(),
                    number + 1,
                    e
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

impl EventSource for JsonlEventSource {
    fn source_state(&self, _rule: &Rule) -> Result<SourceState, DetectError> {
        let last_event_time = self
            .read_records()?
            .iter()
            .map(|r| r.time)
            .max();
        Ok(SourceState {
            up_to_date: true,
            last_event_time,
        })
    }

    fn events<'s>(
        &'s mut self,
        _rule: &Rule,
        window: &ExecutionWindow,
    ) -> Result<Box<dyn Iterator<Item = Result<FieldValueRow, DetectError>> + 's>, DetectError>
    {
        let (from, to) = (window.from, window.to);
        let rows = self
            .read_records()?
            .into_iter()
            .filter(move |r| r.time > from && r.time <= to)
            .map(|r| Ok(r.fields.into_iter().collect()));
        Ok(Box::new(rows))
    }
}

// ── Execution tracker ───────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleState {
    watermark: Option<DateTime<Utc>>,
    progress: Option<u64>,
    #[serde(default)]
    owner_nodes: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerState {
    rules: HashMap<Uuid, RuleState>,
    history: Vec<ExecutionRecord>,
}

/// Execution state persisted as a single JSON file, rewritten atomically on
/// every mutation.
struct FileTracker {
    path: PathBuf,
    state: TrackerState,
}

impl FileTracker {
    fn load(path: PathBuf) -> Result<Self, DetectError> {
        let state = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| DetectError::Tracker(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrackerState::default(),
            Err(e) => return Err(DetectError::Tracker(e.to_string())),
        };
        Ok(Self { path, state })
    }

    fn save(&self) -> Result<(), DetectError> {
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&self.state)
            .map_err(|e| DetectError::Tracker(e.to_string()))?;
        fs::write(&tmp, text).map_err(|e| DetectError::Tracker(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| DetectError::Tracker(e.to_string()))
    }

    fn entry(&mut self, rule_uuid: Uuid) -> &mut RuleState {
        self.state.rules.entry(rule_uuid).or_default()
    }
}

impl ExecutionTracker for FileTracker {
    fn watermark(&self, rule_uuid: Uuid) -> Result<Option<DateTime<Utc>>, DetectError> {
        Ok(self.state.rules.get(&rule_uuid).and_then(|s| s.watermark))
    }

    fn advance_watermark(
        &mut self,
        rule_uuid: Uuid,
        to: DateTime<Utc>,
    ) -> Result<(), DetectError> {
        self.entry(rule_uuid).watermark = Some(to);
        self.save()
    }

    fn last_committed_event_id(&self, rule_uuid: Uuid) -> Result<Option<u64>, DetectError> {
        Ok(self.state.rules.get(&rule_uuid).and_then(|s| s.progress))
    }

    fn record_progress(&mut self, rule_uuid: Uuid, last_event_id: u64) -> Result<(), DetectError> {
        self.entry(rule_uuid).progress = Some(last_event_id);
        self.save()
    }

    fn clear_progress(&mut self, rule_uuid: Uuid) -> Result<(), DetectError> {
        self.entry(rule_uuid).progress = None;
        self.save()
    }

    fn record_history(&mut self, record: ExecutionRecord) -> Result<(), DetectError> {
        self.state.history.push(record);
        self.save()
    }

    fn owner_nodes(&self, rule_uuid: Uuid) -> Result<Vec<String>, DetectError> {
        Ok(self
            .state
            .rules
            .get(&rule_uuid)
            .map(|s| s.owner_nodes.clone())
            .unwrap_or_default())
    }
}

// ── Feed writer sink ────────────────────────────────────────────────

/// Appends detections to `{output_dir}/{destination}.jsonl`, one JSON
/// object per line. The file is opened on `start` and flushed on `end`.
struct FeedWriterSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FeedWriterSink {
    fn new(output_dir: &Path, destination: &str) -> Self {
        Self {
            path: output_dir.join(format!("{destination}.jsonl")),
            writer: None,
        }
    }
}

impl DetectionSink for FeedWriterSink {
    fn start(&mut self) -> Result<(), DetectError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DetectError::Delivery(format!("{}: {}", self.path.display(), e)))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn accept(&mut self, detection: Detection) -> Result<(), DetectError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DetectError::Delivery("feed writer not started".to_string()))?;
        let line = serde_json::to_string(&detection)
            .map_err(|e| DetectError::Delivery(e.to_string()))?;
        writeln!(writer, "{line}").map_err(|e| DetectError::Delivery(e.to_string()))
    }

    fn end(&mut self) -> Result<(), DetectError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| DetectError::Delivery(e.to_string()))?;
        }
        Ok(())
    }
}

// ── Execution cycle ─────────────────────────────────────────────────

fn run_cycle(
    config: &DetectConfig,
    registry: &ThrottleRegistry,
    dirs: &DuplicateCheckDirs,
    tracker: &mut FileTracker,
    now: DateTime<Utc>,
) {
    let rules = load_rules(&config.rules_dir);
    if rules.is_empty() {
        info!("no rules loaded, nothing to do");
        return;
    }

    for rule in &rules {
        // Policy edits picked up here survive across cycles without
        // resetting throttle counters.
        registry.refresh(rule.uuid, &rule.notification.policy);
        let throttle = registry.get_or_create(rule.uuid, &rule.notification.policy);
        throttle.enable_if_possible(now);

        let store = match DuplicateCheckStore::open(dirs, rule.uuid, rule.dedup_columns()) {
            Ok(store) => store,
            Err(e) => {
                error!(rule_id = %rule.uuid, error = %e, "cannot open duplicate-check store");
                continue;
            }
        };

        let destination = rule.notification.destination.as_deref().unwrap_or("void");
        let mut sink = FeedWriterSink::new(&config.output_dir, destination);
        let mut source = JsonlEventSource::new(config.events_file.clone());

        let pipeline = DetectionPipeline::new(
            rule,
            &config.node_name,
            &mut source,
            tracker,
            &store,
            throttle.as_ref(),
            &mut sink,
        );
        // Failures are already logged with context by the pipeline; the
        // next cycle retries the window.
        let _ = pipeline.run(now);
    }
}

/// Drop duplicate-check stores whose rule no longer exists.
fn reconcile_stores(config: &DetectConfig, dirs: &DuplicateCheckDirs) {
    let active: HashSet<Uuid> = load_rules(&config.rules_dir)
        .iter()
        .map(|r| r.uuid)
        .collect();
    let removed = dirs.reconcile(&active);
    if removed > 0 {
        info!(removed, "reconcile sweep deleted orphaned duplicate-check stores");
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = DetectConfig::from_env();
    if let Some(interval) = cli.interval_secs {
        config.interval_secs = interval;
    }
    config.log_summary();

    fs::create_dir_all(&config.rules_dir)?;
    fs::create_dir_all(&config.output_dir)?;
    fs::create_dir_all(&config.dedup_dir)?;
    if let Some(parent) = config.state_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let registry = ThrottleRegistry::new();
    let dirs = DuplicateCheckDirs::new(config.dedup_dir.clone());
    let mut tracker = FileTracker::load(config.state_file.clone())?;

    if cli.once {
        run_cycle(&config, &registry, &dirs, &mut tracker, Utc::now());
        reconcile_stores(&config, &dirs);
        return Ok(());
    }

    info!("detect-worker starting");
    let mut ticker = tokio::time::interval(StdDuration::from_secs(config.interval_secs.max(1)));
    let mut cycles: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cycle(&config, &registry, &dirs, &mut tracker, Utc::now());
                cycles += 1;
                if cycles % config.reconcile_every == 0 {
                    reconcile_stores(&config, &dirs);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("detect-worker shutting down");
                break;
            }
        }
    }
    Ok(())
}
