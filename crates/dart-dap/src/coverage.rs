//! Line coverage collection over the VM `getSourceReport` RPC.
//!
//! The client nominates the files it cares about; collection walks every
//! isolate's scripts, asks the VM for token-level coverage, and maps token
//! positions back to lines through the script's token position table. Results
//! are surfaced as `dart.coverage` events. Collection is throttled so a
//! chatty client cannot hammer a paused VM.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    time::Duration,
};

use dart_vmservice::VmConnection;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::DebugResult;

pub const COVERAGE_THROTTLE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct CoverageState {
    tracked: HashSet<String>,
    last_run: Option<Instant>,
}

pub struct CoverageCollector {
    throttle: Duration,
    state: Mutex<CoverageState>,
}

impl CoverageCollector {
    pub fn new() -> Self {
        Self::with_throttle(COVERAGE_THROTTLE)
    }

    pub fn with_throttle(throttle: Duration) -> Self {
        Self {
            throttle,
            state: Mutex::new(CoverageState::default()),
        }
    }

    /// Replace the set of script URIs coverage is collected for.
    pub async fn set_tracked_files(&self, uris: Vec<String>) {
        let mut state = self.state.lock().await;
        state.tracked = uris.into_iter().collect();
    }

    /// Collect coverage for every tracked script across `isolates`.
    ///
    /// Returns `None` when nothing is tracked or the previous collection was
    /// less than the throttle interval ago; otherwise the `dart.coverage`
    /// event body. Per-isolate RPC failures are logged and skipped, since an
    /// isolate may exit mid-collection.
    pub async fn collect(
        &self,
        vm: &VmConnection,
        isolates: &[String],
    ) -> DebugResult<Option<Value>> {
        let tracked = {
            let mut state = self.state.lock().await;
            if state.tracked.is_empty() {
                return Ok(None);
            }
            if let Some(last) = state.last_run {
                if last.elapsed() < self.throttle {
                    return Ok(None);
                }
            }
            state.last_run = Some(Instant::now());
            state.tracked.clone()
        };

        // uri → (hit lines, missed lines), merged across isolates.
        let mut merged: BTreeMap<String, (BTreeSet<i64>, BTreeSet<i64>)> = BTreeMap::new();

        for isolate_id in isolates {
            if let Err(err) = self
                .collect_isolate(vm, isolate_id, &tracked, &mut merged)
                .await
            {
                tracing::debug!(%isolate_id, error = %err, "coverage collection skipped isolate");
            }
        }

        let coverage: Vec<Value> = merged
            .into_iter()
            .map(|(uri, (hits, misses))| {
                json!({
                    "scriptUri": uri,
                    "hitLines": hits.into_iter().collect::<Vec<_>>(),
                    "missedLines": misses.into_iter().collect::<Vec<_>>(),
                })
            })
            .collect();

        Ok(Some(json!({ "coverage": coverage })))
    }

    async fn collect_isolate(
        &self,
        vm: &VmConnection,
        isolate_id: &str,
        tracked: &HashSet<String>,
        merged: &mut BTreeMap<String, (BTreeSet<i64>, BTreeSet<i64>)>,
    ) -> DebugResult<()> {
        let scripts = vm.get_scripts(isolate_id).await?;
        let Some(scripts) = scripts.get("scripts").and_then(|v| v.as_array()) else {
            return Ok(());
        };

        for script_ref in scripts {
            let (Some(script_id), Some(uri)) = (
                script_ref.get("id").and_then(|v| v.as_str()),
                script_ref.get("uri").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            if !tracked.contains(uri) {
                continue;
            }

            let report = vm.get_source_report(isolate_id, script_id).await?;
            let script = vm.get_script(isolate_id, script_id).await?;

            let entry = merged.entry(uri.to_string()).or_default();
            for range in &report.ranges {
                if !range.compiled {
                    continue;
                }
                let Some(coverage) = &range.coverage else {
                    continue;
                };
                for &token_pos in &coverage.hits {
                    if let Some(line) = script.line_for_token_pos(token_pos) {
                        entry.0.insert(line);
                    }
                }
                for &token_pos in &coverage.misses {
                    if let Some(line) = script.line_for_token_pos(token_pos) {
                        entry.1.insert(line);
                    }
                }
            }
            // A line that is hit in any isolate is not a miss.
            let hits = entry.0.clone();
            entry.1.retain(|line| !hits.contains(line));
        }
        Ok(())
    }
}

impl Default for CoverageCollector {
    fn default() -> Self {
        Self::new()
    }
}
