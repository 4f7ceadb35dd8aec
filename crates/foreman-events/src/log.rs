use crate::reducer::{self, FoldState};
use foreman_core::{ForemanError, ForemanResult, Lane, StatusEvent, WpId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Append-only status event log for one feature.
///
/// Backed by a JSON-lines file; `append` is the only write path and the
/// caller is expected to serialize appends per feature (the engine wraps the
/// log in a mutex so at most one append is in flight). A cached lane
/// snapshot is maintained incrementally through the same fold rules as
/// [`reducer::fold`], so the cache is always re-derivable from the log; any
/// mismatch is a materialization drift, reported and rebuilt but never
/// silently repaired.
#[derive(Debug)]
pub struct StatusLog {
    feature: String,
    path: Option<PathBuf>,
    events: Vec<StatusEvent>,
    clock: u64,
    cache: FoldState,
}

impl StatusLog {
    /// Opens (or creates) the log file for a feature, replaying any existing
    /// records. Records are read in file order and never reordered.
    pub async fn open(feature: impl Into<String>, path: PathBuf) -> ForemanResult<Self> {
        let feature = feature.into();
        let mut events = Vec::new();

        if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            for (lineno, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let event: StatusEvent = serde_json::from_str(line).map_err(|e| {
                    ForemanError::Event(format!(
                        "corrupt record at {}:{}: {e}",
                        path.display(),
                        lineno + 1
                    ))
                })?;
                events.push(event);
            }
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let clock = events.iter().map(|e| e.logical_clock).max().unwrap_or(0);
        let cache = FoldState::from_events(&events);

        info!(
            feature = %feature,
            path = %path.display(),
            replayed = events.len(),
            "status log opened"
        );

        Ok(Self {
            feature,
            path: Some(path),
            events,
            clock,
            cache,
        })
    }

    /// An ephemeral log with no backing file.
    pub fn in_memory(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            path: None,
            events: Vec::new(),
            clock: 0,
            cache: FoldState::default(),
        }
    }

    /// Appends one event: checks guard conditions, stamps the logical
    /// clock, persists the record, then updates the cached snapshot.
    ///
    /// This is the only mutation the log supports.
    pub async fn append(&mut self, mut event: StatusEvent) -> ForemanResult<()> {
        reducer::check_guards(&event).map_err(ForemanError::Guard)?;

        self.clock += 1;
        event.logical_clock = self.clock;

        if let Some(path) = &self.path {
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
        }

        self.cache.apply(&event);
        self.events.push(event);
        Ok(())
    }

    /// Current lane of a work package, from the cached snapshot. Packages
    /// with no recorded transition are `planned`.
    pub fn current_lane(&self, wp: &WpId) -> Lane {
        self.cache.lane_of(wp)
    }

    /// Folds the full log into lanes, bypassing the cache. Pure and
    /// deterministic for any read order of the same records.
    pub fn materialize(&self) -> BTreeMap<WpId, Lane> {
        reducer::fold(&self.events)
    }

    /// Compares the cached snapshot against a fresh fold. On mismatch the
    /// cache is discarded and rebuilt from the log, and the drift is both
    /// logged and returned as an error so callers can account for it.
    pub fn verify_snapshot(&mut self) -> ForemanResult<()> {
        let fresh = FoldState::from_events(&self.events);
        if fresh.lanes() == self.cache.lanes() {
            return Ok(());
        }

        let diff: Vec<String> = fresh
            .lanes()
            .iter()
            .filter(|(wp, lane)| self.cache.lanes().get(*wp) != Some(lane))
            .map(|(wp, lane)| {
                format!(
                    "{wp}: cached {:?}, log says {lane}",
                    self.cache.lanes().get(wp)
                )
            })
            .collect();
        let description = format!("feature {}: {}", self.feature, diff.join("; "));

        warn!(feature = %self.feature, drift = %description, "materialization drift detected");
        self.cache = fresh;

        Err(ForemanError::Drift(description))
    }

    /// Every recorded event for one work package, in log order. Used to
    /// attach the full audit trail to terminal failures.
    pub fn event_trail(&self, wp: &WpId) -> Vec<StatusEvent> {
        self.events
            .iter()
            .filter(|e| &e.work_package_id == wp)
            .cloned()
            .collect()
    }

    /// All recorded events, in log order.
    pub fn events(&self) -> &[StatusEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }
}
