//! Isolate tracking: maps VM isolates onto DAP threads and owns breakpoint,
//! pause-state, and exception-mode bookkeeping for each of them.
//!
//! DAP thread numbers are small monotonically increasing integers that are
//! never reused, so a stale `threadId` from the client resolves to "unknown
//! thread" rather than silently pointing at a newer isolate.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};

use dart_vmservice::{ExceptionPauseMode, IsolateRef, StepKind, VmConnection};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    error::{DebugError, DebugResult},
    package_map::PackageMap,
};

/// One breakpoint as requested by the DAP client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceBreakpoint {
    pub line: i64,
    pub column: Option<i64>,
    pub condition: Option<String>,
    pub log_message: Option<String>,
}

/// A client breakpoint with its adapter-assigned id. The id appears in
/// `setBreakpoints` responses and is what pause events are matched back to.
#[derive(Clone, Debug)]
pub struct ClientBreakpoint {
    pub id: i64,
    pub breakpoint: SourceBreakpoint,
}

/// Which libraries the VM should treat as debuggable.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibraryPolicy {
    pub debug_sdk_libraries: bool,
    pub debug_external_package_libraries: bool,
}

/// Per-isolate state tracked by the manager.
#[derive(Debug)]
struct ThreadInfo {
    num: i64,
    isolate: IsolateRef,
    paused: bool,
    paused_on_start: bool,
    at_async_suspension: bool,
    /// Set while a resume RPC for this thread is in flight, so concurrent
    /// resume requests collapse into one.
    resuming: bool,
    /// Breakpoints for tracked URIs have been installed on this isolate at
    /// least once. Startup resume is held until this is true.
    initial_breakpoints_installed: bool,
    current_exception: Option<Value>,
    /// VM breakpoint ids installed on this isolate, per script URI.
    vm_breakpoints: HashMap<String, Vec<String>>,
    /// VM breakpoint id → adapter-assigned client breakpoint id.
    vm_breakpoint_client_ids: HashMap<String, i64>,
}

#[derive(Default)]
struct ManagerState {
    next_thread_num: i64,
    next_breakpoint_id: i64,
    /// Keyed by isolate id.
    threads: HashMap<String, ThreadInfo>,
    /// Client breakpoints per script URI: the single source of truth that is
    /// replayed onto every isolate.
    breakpoints: HashMap<String, Vec<ClientBreakpoint>>,
    exception_mode: ExceptionPauseMode,
    configuration_done: bool,
}

/// Tracks the isolates of the target VM and their DAP-visible thread state.
pub struct ThreadManager {
    policy: LibraryPolicy,
    package_map: Arc<PackageMap>,
    local_root: Option<PathBuf>,
    state: Mutex<ManagerState>,
}

impl ThreadManager {
    pub fn new(
        policy: LibraryPolicy,
        package_map: Arc<PackageMap>,
        local_root: Option<PathBuf>,
    ) -> Self {
        Self {
            policy,
            package_map,
            local_root,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Register an isolate, returning `(thread number, is_new)`. Registration
    /// is idempotent: a second event for the same isolate id returns the
    /// existing thread number with `is_new == false`, so the caller emits at
    /// most one `thread started` event per isolate.
    pub async fn register(&self, isolate: &IsolateRef) -> (i64, bool) {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.threads.get(&isolate.id) {
            return (existing.num, false);
        }
        state.next_thread_num += 1;
        let num = state.next_thread_num;
        state.threads.insert(
            isolate.id.clone(),
            ThreadInfo {
                num,
                isolate: isolate.clone(),
                paused: false,
                paused_on_start: false,
                at_async_suspension: false,
                resuming: false,
                initial_breakpoints_installed: false,
                current_exception: None,
                vm_breakpoints: HashMap::new(),
                vm_breakpoint_client_ids: HashMap::new(),
            },
        );
        (num, true)
    }

    /// Forget an exited isolate, returning its thread number for the
    /// `thread exited` event.
    pub async fn remove(&self, isolate_id: &str) -> Option<i64> {
        let mut state = self.state.lock().await;
        state.threads.remove(isolate_id).map(|t| t.num)
    }

    pub async fn thread_num(&self, isolate_id: &str) -> Option<i64> {
        let state = self.state.lock().await;
        state.threads.get(isolate_id).map(|t| t.num)
    }

    pub async fn isolate_for_thread(&self, thread_num: i64) -> DebugResult<IsolateRef> {
        let state = self.state.lock().await;
        state
            .threads
            .values()
            .find(|t| t.num == thread_num)
            .map(|t| t.isolate.clone())
            .ok_or(DebugError::UnknownThread(thread_num))
    }

    /// `(thread number, isolate name)` for every live thread, ordered by
    /// thread number.
    pub async fn thread_list(&self) -> Vec<(i64, String)> {
        let state = self.state.lock().await;
        let mut threads: Vec<_> = state
            .threads
            .values()
            .map(|t| (t.num, t.isolate.name.clone()))
            .collect();
        threads.sort_by_key(|(num, _)| *num);
        threads
    }

    pub async fn is_paused(&self, thread_num: i64) -> bool {
        let state = self.state.lock().await;
        state
            .threads
            .values()
            .any(|t| t.num == thread_num && t.paused)
    }

    pub async fn at_async_suspension(&self, thread_num: i64) -> bool {
        let state = self.state.lock().await;
        state
            .threads
            .values()
            .any(|t| t.num == thread_num && t.at_async_suspension)
    }

    pub async fn mark_paused(
        &self,
        isolate_id: &str,
        on_start: bool,
        at_async_suspension: bool,
        exception: Option<Value>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(thread) = state.threads.get_mut(isolate_id) {
            thread.paused = true;
            thread.paused_on_start = on_start;
            thread.at_async_suspension = at_async_suspension;
            thread.current_exception = exception;
        }
    }

    /// Clear pause state after a VM `Resume` event (covers resumes the
    /// adapter did not initiate, e.g. another VM Service client).
    pub async fn mark_running(&self, isolate_id: &str) -> Option<i64> {
        let mut state = self.state.lock().await;
        let thread = state.threads.get_mut(isolate_id)?;
        let was_paused = thread.paused;
        thread.paused = false;
        thread.paused_on_start = false;
        thread.at_async_suspension = false;
        thread.current_exception = None;
        was_paused.then_some(thread.num)
    }

    pub async fn exception_for_thread(&self, thread_num: i64) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .threads
            .values()
            .find(|t| t.num == thread_num)
            .and_then(|t| t.current_exception.clone())
    }

    /// Resume (or step) a thread. Returns `true` when the thread actually
    /// transitioned to running; a resume of a non-paused thread, or one with
    /// a resume already in flight, is a successful no-op.
    ///
    /// The VM answering "isolate must be paused" is also treated as a no-op:
    /// it means something else resumed the isolate first.
    pub async fn resume(
        &self,
        vm: &VmConnection,
        thread_num: i64,
        step: Option<StepKind>,
    ) -> DebugResult<bool> {
        let isolate_id = {
            let mut state = self.state.lock().await;
            let Some(thread) = state.threads.values_mut().find(|t| t.num == thread_num) else {
                return Err(DebugError::UnknownThread(thread_num));
            };
            if !thread.paused || thread.resuming {
                return Ok(false);
            }
            thread.resuming = true;
            thread.isolate.id.clone()
        };

        let result = vm.resume(&isolate_id, step).await;

        let mut state = self.state.lock().await;
        let Some(thread) = state.threads.get_mut(&isolate_id) else {
            // Isolate exited while the RPC was in flight.
            return Ok(false);
        };
        thread.resuming = false;
        match result {
            Ok(()) => {
                thread.paused = false;
                thread.paused_on_start = false;
                thread.at_async_suspension = false;
                thread.current_exception = None;
                Ok(true)
            }
            Err(err) if err.is_isolate_must_be_paused() => {
                thread.paused = false;
                thread.paused_on_start = false;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Configure a newly runnable isolate: exception pause mode, library
    /// debuggability, and a full replay of tracked breakpoints, issued
    /// concurrently. Returns `true` when the thread is paused on start and
    /// the session may now resume it (startup gating permitting).
    pub async fn configure_isolate(
        &self,
        vm: &VmConnection,
        isolate_id: &str,
    ) -> DebugResult<bool> {
        let (mode, is_system) = {
            let state = self.state.lock().await;
            let Some(thread) = state.threads.get(isolate_id) else {
                return Ok(false);
            };
            (state.exception_mode, thread.isolate.is_system_isolate)
        };

        let (exceptions, libraries, breakpoints) = tokio::join!(
            vm.set_exception_pause_mode(isolate_id, effective_mode(mode, is_system)),
            self.apply_library_policy(vm, isolate_id),
            self.sync_breakpoints_for_isolate(vm, isolate_id),
        );
        exceptions?;
        libraries?;
        breakpoints?;

        let mut state = self.state.lock().await;
        let Some(thread) = state.threads.get_mut(isolate_id) else {
            return Ok(false);
        };
        thread.initial_breakpoints_installed = true;
        Ok(thread.paused_on_start && state.configuration_done)
    }

    /// Change the exception pause mode and push it to every live isolate.
    pub async fn set_exception_pause_mode(
        &self,
        vm: &VmConnection,
        mode: ExceptionPauseMode,
    ) -> DebugResult<()> {
        let isolates: Vec<(String, bool)> = {
            let mut state = self.state.lock().await;
            state.exception_mode = mode;
            state
                .threads
                .values()
                .map(|t| (t.isolate.id.clone(), t.isolate.is_system_isolate))
                .collect()
        };
        for (isolate_id, is_system) in isolates {
            vm.set_exception_pause_mode(&isolate_id, effective_mode(mode, is_system))
                .await?;
        }
        Ok(())
    }

    /// Replace the breakpoints for one script URI and push the change to every
    /// live isolate. Returns `(client id, verified)` per breakpoint, in
    /// request order; a breakpoint is verified when at least one isolate
    /// accepted it.
    pub async fn set_breakpoints(
        &self,
        vm: &VmConnection,
        uri: &str,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> DebugResult<Vec<(i64, bool)>> {
        let (client_breakpoints, isolate_ids) = {
            let mut state = self.state.lock().await;
            let client_breakpoints: Vec<ClientBreakpoint> = breakpoints
                .into_iter()
                .map(|breakpoint| {
                    state.next_breakpoint_id += 1;
                    ClientBreakpoint {
                        id: state.next_breakpoint_id,
                        breakpoint,
                    }
                })
                .collect();
            // An empty list stops tracking the URI entirely; new isolates
            // will not have anything replayed for it.
            if client_breakpoints.is_empty() {
                state.breakpoints.remove(uri);
            } else {
                state
                    .breakpoints
                    .insert(uri.to_string(), client_breakpoints.clone());
            }
            let isolate_ids: Vec<String> = state.threads.keys().cloned().collect();
            (client_breakpoints, isolate_ids)
        };

        let mut verified: HashMap<i64, bool> =
            client_breakpoints.iter().map(|bp| (bp.id, false)).collect();

        for isolate_id in isolate_ids {
            let results = self
                .replace_breakpoints_on_isolate(vm, &isolate_id, uri, &client_breakpoints)
                .await;
            for (client_id, ok) in results {
                if ok {
                    verified.insert(client_id, true);
                }
            }
        }

        Ok(client_breakpoints
            .iter()
            .map(|bp| (bp.id, verified.get(&bp.id).copied().unwrap_or(false)))
            .collect())
    }

    /// Look up the client breakpoint a VM pause event refers to. `None` means
    /// a breakpoint the adapter did not set (or one whose mapping was lost);
    /// callers treat that as an unconditional stop.
    pub async fn client_breakpoint_for_vm_id(
        &self,
        isolate_id: &str,
        vm_breakpoint_id: &str,
    ) -> Option<ClientBreakpoint> {
        let state = self.state.lock().await;
        let thread = state.threads.get(isolate_id)?;
        let client_id = *thread.vm_breakpoint_client_ids.get(vm_breakpoint_id)?;
        state
            .breakpoints
            .values()
            .flatten()
            .find(|bp| bp.id == client_id)
            .cloned()
    }

    /// Mark configuration as done and return the threads that were held
    /// paused on start and are now allowed to resume.
    pub async fn mark_configuration_done(&self) -> Vec<i64> {
        let mut state = self.state.lock().await;
        state.configuration_done = true;
        state
            .threads
            .values()
            .filter(|t| t.paused_on_start && t.initial_breakpoints_installed)
            .map(|t| t.num)
            .collect()
    }

    pub async fn configuration_done(&self) -> bool {
        self.state.lock().await.configuration_done
    }

    /// All VM breakpoints currently tracked, per isolate. Used during
    /// attach-mode teardown to restore the target's state.
    pub async fn all_vm_breakpoints(&self) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        state
            .threads
            .values()
            .flat_map(|t| {
                t.vm_breakpoints
                    .values()
                    .flatten()
                    .map(|bp| (t.isolate.id.clone(), bp.clone()))
            })
            .collect()
    }

    /// Isolate ids of every live thread.
    pub async fn isolate_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.threads.values().map(|t| t.isolate.id.clone()).collect()
    }

    /// Whether a startup-paused isolate has cleared both gates: initial
    /// breakpoints installed and the client's configuration finished.
    pub async fn ready_for_startup_resume(&self, isolate_id: &str) -> bool {
        let state = self.state.lock().await;
        state.configuration_done
            && state
                .threads
                .get(isolate_id)
                .map(|t| t.paused_on_start && t.initial_breakpoints_installed)
                .unwrap_or(false)
    }

    /// Isolate ids of every currently paused thread.
    pub async fn paused_isolates(&self) -> Vec<(i64, String)> {
        let state = self.state.lock().await;
        state
            .threads
            .values()
            .filter(|t| t.paused)
            .map(|t| (t.num, t.isolate.id.clone()))
            .collect()
    }

    async fn apply_library_policy(&self, vm: &VmConnection, isolate_id: &str) -> DebugResult<()> {
        let isolate = vm.get_isolate(isolate_id).await?;
        let Some(libraries) = isolate.get("libraries").and_then(|l| l.as_array()) else {
            return Ok(());
        };
        for library in libraries {
            let (Some(id), Some(uri)) = (
                library.get("id").and_then(|v| v.as_str()),
                library.get("uri").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let debuggable = self.library_debuggable(uri);
            if !debuggable {
                vm.set_library_debuggable(isolate_id, id, false).await?;
            }
        }
        Ok(())
    }

    /// Whether a library should be debuggable under the configured policy.
    pub fn library_debuggable(&self, uri: &str) -> bool {
        if uri.starts_with("dart:") {
            return self.policy.debug_sdk_libraries;
        }
        if uri.starts_with("package:") && self.is_external_package(uri) {
            return self.policy.debug_external_package_libraries;
        }
        true
    }

    /// A `package:` library is external when its resolved path is outside the
    /// local program root. Unresolvable URIs are treated as local so a missing
    /// package map never disables stepping through user code.
    fn is_external_package(&self, uri: &str) -> bool {
        let Some(path) = self.package_map.resolve(uri) else {
            return false;
        };
        match &self.local_root {
            Some(root) => !path.starts_with(root),
            None => false,
        }
    }

    async fn sync_breakpoints_for_isolate(
        &self,
        vm: &VmConnection,
        isolate_id: &str,
    ) -> DebugResult<()> {
        let breakpoints: Vec<(String, Vec<ClientBreakpoint>)> = {
            let state = self.state.lock().await;
            state
                .breakpoints
                .iter()
                .map(|(uri, bps)| (uri.clone(), bps.clone()))
                .collect()
        };
        for (uri, bps) in breakpoints {
            self.replace_breakpoints_on_isolate(vm, isolate_id, &uri, &bps)
                .await;
        }
        Ok(())
    }

    /// Remove the VM breakpoints previously installed for `uri` on one
    /// isolate, then install the new set. Individual failures are recorded as
    /// unverified rather than failing the whole request; the isolate may pause
    /// or exit at any point during this.
    async fn replace_breakpoints_on_isolate(
        &self,
        vm: &VmConnection,
        isolate_id: &str,
        uri: &str,
        breakpoints: &[ClientBreakpoint],
    ) -> Vec<(i64, bool)> {
        let stale = {
            let mut state = self.state.lock().await;
            match state.threads.get_mut(isolate_id) {
                Some(thread) => {
                    let stale = thread.vm_breakpoints.remove(uri).unwrap_or_default();
                    for vm_id in &stale {
                        thread.vm_breakpoint_client_ids.remove(vm_id);
                    }
                    stale
                }
                None => return Vec::new(),
            }
        };

        for vm_id in stale {
            if let Err(err) = vm.remove_breakpoint(isolate_id, &vm_id).await {
                tracing::debug!(%isolate_id, %vm_id, error = %err, "removeBreakpoint failed");
            }
        }

        let mut results = Vec::with_capacity(breakpoints.len());
        let mut installed: Vec<(String, i64)> = Vec::new();
        for client_bp in breakpoints {
            let added = vm
                .add_breakpoint_with_script_uri(
                    isolate_id,
                    uri,
                    client_bp.breakpoint.line,
                    client_bp.breakpoint.column,
                )
                .await;
            match added {
                Ok(vm_bp) => {
                    let ok = match vm_bp.get("id").and_then(|v| v.as_str()) {
                        Some(vm_id) => {
                            installed.push((vm_id.to_string(), client_bp.id));
                            true
                        }
                        None => false,
                    };
                    results.push((client_bp.id, ok));
                }
                Err(err) => {
                    tracing::debug!(
                        %isolate_id, %uri, line = client_bp.breakpoint.line, error = %err,
                        "addBreakpointWithScriptUri failed"
                    );
                    results.push((client_bp.id, false));
                }
            }
        }

        let mut state = self.state.lock().await;
        if let Some(thread) = state.threads.get_mut(isolate_id) {
            let uri_breakpoints = thread.vm_breakpoints.entry(uri.to_string()).or_default();
            for (vm_id, client_id) in installed {
                uri_breakpoints.push(vm_id.clone());
                thread.vm_breakpoint_client_ids.insert(vm_id, client_id);
            }
        }
        results
    }
}

/// `All` degrades to `Unhandled` on system isolates so infrastructure code
/// (e.g. the kernel isolate) does not trap on caught exceptions.
fn effective_mode(mode: ExceptionPauseMode, is_system_isolate: bool) -> ExceptionPauseMode {
    if is_system_isolate && mode == ExceptionPauseMode::All {
        ExceptionPauseMode::Unhandled
    } else {
        mode
    }
}
