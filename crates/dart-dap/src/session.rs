//! The debug session controller: owns the target process (in launch mode),
//! the VM Service connection, and all the translation between DAP requests
//! and VM Service RPCs.
//!
//! One `DebugSession` lives for the lifetime of the adapter process. DAP
//! events flow out through an unbounded channel to the wire writer; VM
//! Service events flow in through a pump task spawned at connect time.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use dart_vmservice::{
    http_uri_to_ws, ExceptionPauseMode, IsolateRef, Script, StepKind, VmConnection, VmEvent,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{mpsc, watch, Mutex},
};

use crate::{
    coverage::CoverageCollector,
    error::{DebugError, DebugResult},
    package_map::PackageMap,
    registry::{StoredData, StoredRefs},
    threads::{LibraryPolicy, SourceBreakpoint, ThreadManager},
    variables::Marshaler,
};

/// Budget for a single user-facing expression evaluation (conditions,
/// logpoints, and the `evaluate` request). A hung evaluation must not wedge
/// the adapter.
pub const EVALUATE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a terminating child gets after SIGINT before SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Budget for each best-effort RPC during detach teardown.
pub const TEARDOWN_RPC_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a closed VM socket waits for the launched child's own exit
/// before the session forces termination. Socket closure usually just means
/// the process died and its exit notification is still in flight.
pub const VM_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Banner lines the Dart VM prints when its service starts. Only stdout
/// emitted *before* a connection exists is scanned for these.
pub const VM_SERVICE_BANNERS: &[&str] = &[
    "The Dart VM service is listening on ",
    "Observatory listening on ",
];

/// An event on its way to the DAP client. The wire writer assigns `seq`.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub event: String,
    pub body: Option<Value>,
}

pub type EventSender = mpsc::UnboundedSender<OutgoingEvent>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArgs {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    /// Extra flags for the VM itself, placed before the script path.
    #[serde(default)]
    pub vm_additional_args: Vec<String>,
    #[serde(default)]
    pub tool_args: Vec<String>,
    pub dart_sdk_path: Option<String>,
    #[serde(default)]
    pub no_debug: bool,
    #[serde(default)]
    pub debug_sdk_libraries: bool,
    #[serde(default)]
    pub debug_external_package_libraries: bool,
    #[serde(default)]
    pub evaluate_to_string_in_debug_views: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArgs {
    pub vm_service_uri: String,
    pub cwd: Option<String>,
    #[serde(default)]
    pub debug_sdk_libraries: bool,
    #[serde(default)]
    pub debug_external_package_libraries: bool,
    #[serde(default)]
    pub evaluate_to_string_in_debug_views: bool,
}

#[derive(Clone)]
struct Connected {
    vm: VmConnection,
    threads: Arc<ThreadManager>,
}

struct Settings {
    policy: LibraryPolicy,
    package_map: Arc<PackageMap>,
    local_root: Option<PathBuf>,
    evaluate_to_string: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy: LibraryPolicy::default(),
            package_map: Arc::new(PackageMap::default()),
            local_root: None,
            evaluate_to_string: false,
        }
    }
}

pub struct DebugSession {
    events: EventSender,
    refs: Mutex<StoredRefs>,
    coverage: CoverageCollector,
    settings: StdMutex<Settings>,
    connected: StdMutex<Option<Connected>>,
    /// `(isolate id, script id)` → script, so stack walks do not re-fetch
    /// token tables frame by frame.
    scripts: StdMutex<HashMap<(String, String), Script>>,
    attach_mode: AtomicBool,
    no_debug: AtomicBool,
    /// Pid of the launched child, 0 when none.
    child_pid: AtomicU32,
    child_exit: StdMutex<Option<watch::Receiver<Option<i32>>>>,
    /// Custom `dart.*` events raised before `initialized` are queued and
    /// replayed once the client is ready for them.
    initialized_sent: AtomicBool,
    queued_custom_events: StdMutex<Vec<OutgoingEvent>>,
    terminated_sent: AtomicBool,
}

impl DebugSession {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            refs: Mutex::new(StoredRefs::new()),
            coverage: CoverageCollector::new(),
            settings: StdMutex::new(Settings::default()),
            connected: StdMutex::new(None),
            scripts: StdMutex::new(HashMap::new()),
            attach_mode: AtomicBool::new(false),
            no_debug: AtomicBool::new(false),
            child_pid: AtomicU32::new(0),
            child_exit: StdMutex::new(None),
            initialized_sent: AtomicBool::new(false),
            queued_custom_events: StdMutex::new(Vec::new()),
            terminated_sent: AtomicBool::new(false),
        }
    }

    // ---- event plumbing ----------------------------------------------------

    fn emit_event(&self, event: &str, body: Option<Value>) {
        let _ = self.events.send(OutgoingEvent {
            event: event.to_string(),
            body,
        });
    }

    fn emit_output(&self, category: &str, output: impl Into<String>) {
        self.emit_event(
            "output",
            Some(json!({"category": category, "output": output.into()})),
        );
    }

    /// Emit a `dart.*` custom event, queueing it until `initialized` has gone
    /// out so the client never sees custom traffic before the handshake.
    fn emit_custom_event(&self, event: &str, body: Value) {
        let outgoing = OutgoingEvent {
            event: event.to_string(),
            body: Some(body),
        };
        if self.initialized_sent.load(Ordering::SeqCst) {
            let _ = self.events.send(outgoing);
        } else {
            self.queued_custom_events.lock().unwrap().push(outgoing);
        }
    }

    fn emit_initialized(&self) {
        if self.initialized_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit_event("initialized", None);
        let queued = std::mem::take(&mut *self.queued_custom_events.lock().unwrap());
        for event in queued {
            let _ = self.events.send(event);
        }
    }

    fn emit_terminated(&self) {
        if !self.terminated_sent.swap(true, Ordering::SeqCst) {
            self.emit_event("terminated", None);
        }
    }

    fn connection(&self) -> DebugResult<Connected> {
        self.connected
            .lock()
            .unwrap()
            .clone()
            .ok_or(DebugError::NotConnected)
    }

    fn is_attach(&self) -> bool {
        self.attach_mode.load(Ordering::SeqCst)
    }

    // ---- launch / attach ---------------------------------------------------

    pub async fn launch(self: &Arc<Self>, arguments: Value) -> DebugResult<()> {
        let args: LaunchArgs = serde_json::from_value(arguments)
            .map_err(|err| DebugError::InvalidRequest(format!("bad launch arguments: {err}")))?;
        self.attach_mode.store(false, Ordering::SeqCst);
        self.no_debug.store(args.no_debug, Ordering::SeqCst);

        let local_root = args
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| Path::new(&args.program).parent().map(Path::to_path_buf));
        self.apply_settings(
            LibraryPolicy {
                debug_sdk_libraries: args.debug_sdk_libraries,
                debug_external_package_libraries: args.debug_external_package_libraries,
            },
            local_root.clone(),
            args.evaluate_to_string_in_debug_views,
        );

        let dart = args
            .dart_sdk_path
            .as_ref()
            .map(|sdk| {
                Path::new(sdk)
                    .join("bin")
                    .join("dart")
                    .to_string_lossy()
                    .into_owned()
            })
            .unwrap_or_else(|| "dart".to_string());

        let mut command = Command::new(&dart);
        command.args(&args.vm_additional_args);
        if !args.no_debug {
            command.arg("--enable-vm-service=0");
            command.arg("--pause_isolates_on_start");
        }
        command.args(&args.tool_args);
        command.arg(&args.program);
        command.args(&args.args);
        if let Some(cwd) = &args.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        let mut child = command.spawn().map_err(|err| {
            DebugError::InvalidRequest(format!("failed to spawn {dart:?}: {err}"))
        })?;
        if let Some(pid) = child.id() {
            self.child_pid.store(pid, Ordering::SeqCst);
        }

        if let Some(stdout) = child.stdout.take() {
            let session = Arc::clone(self);
            let scan_for_banner = !args.no_debug;
            tokio::spawn(async move {
                session.pump_stdout(stdout, scan_for_banner).await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    session.emit_output("stderr", format!("{line}\n"));
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        *self.child_exit.lock().unwrap() = Some(exit_rx);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(0),
                Err(err) => {
                    tracing::warn!(error = %err, "wait on child failed");
                    0
                }
            };
            let _ = exit_tx.send(Some(code));
            session.emit_event("exited", Some(json!({"exitCode": code})));
            session.emit_terminated();
        });

        if args.no_debug {
            // Nothing to connect to; the handshake can complete immediately.
            self.emit_initialized();
        }
        Ok(())
    }

    pub async fn attach(self: &Arc<Self>, arguments: Value) -> DebugResult<()> {
        let args: AttachArgs = serde_json::from_value(arguments)
            .map_err(|err| DebugError::InvalidRequest(format!("bad attach arguments: {err}")))?;
        self.attach_mode.store(true, Ordering::SeqCst);

        self.apply_settings(
            LibraryPolicy {
                debug_sdk_libraries: args.debug_sdk_libraries,
                debug_external_package_libraries: args.debug_external_package_libraries,
            },
            args.cwd.as_ref().map(PathBuf::from),
            args.evaluate_to_string_in_debug_views,
        );

        let ws_uri = http_uri_to_ws(&args.vm_service_uri);
        self.connect_to_vm(&ws_uri).await?;

        // No cwd-based package map: fall back to the root library of the
        // first isolate and look for a package config next to it.
        if self.settings.lock().unwrap().package_map.is_empty() {
            if let Err(err) = self.load_package_map_from_root_lib().await {
                tracing::debug!(error = %err, "package map fallback failed");
            }
        }
        Ok(())
    }

    fn apply_settings(
        &self,
        policy: LibraryPolicy,
        local_root: Option<PathBuf>,
        evaluate_to_string: bool,
    ) {
        let package_map = local_root
            .as_deref()
            .and_then(|root| match PackageMap::load_for_root(root) {
                Ok(map) => Some(map),
                Err(err) => {
                    tracing::debug!(error = %err, "no package map loaded");
                    None
                }
            })
            .unwrap_or_default();

        let mut settings = self.settings.lock().unwrap();
        settings.policy = policy;
        settings.local_root = local_root;
        settings.package_map = Arc::new(package_map);
        settings.evaluate_to_string = evaluate_to_string;
    }

    /// Package-map fallback for attach: find the root library of the first
    /// isolate and walk up from its file looking for a package config.
    async fn load_package_map_from_root_lib(&self) -> DebugResult<()> {
        let Connected { vm, .. } = self.connection()?;
        let vm_info = vm.get_vm().await?;
        let Some(isolate_id) = vm_info.pointer("/isolates/0/id").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let isolate = vm.get_isolate(isolate_id).await?;
        let Some(root_uri) = isolate.pointer("/rootLib/uri").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let Some(path) = root_uri.strip_prefix("file://") else {
            return Ok(());
        };

        let mut dir = Path::new(path).parent();
        while let Some(candidate) = dir {
            if let Ok(map) = PackageMap::load_for_root(candidate) {
                let mut settings = self.settings.lock().unwrap();
                settings.package_map = Arc::new(map);
                settings.local_root = Some(candidate.to_path_buf());
                break;
            }
            dir = candidate.parent();
        }
        Ok(())
    }

    async fn pump_stdout(self: &Arc<Self>, stdout: tokio::process::ChildStdout, scan: bool) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if scan && self.connected.lock().unwrap().is_none() {
                if let Some(uri) = parse_vm_service_banner(&line) {
                    let ws_uri = http_uri_to_ws(&uri);
                    if let Err(err) = self.connect_to_vm(&ws_uri).await {
                        self.emit_output(
                            "console",
                            format!("Failed to connect to the VM service: {err}\n"),
                        );
                    }
                    // The banner is adapter-internal; don't forward it.
                    continue;
                }
            }
            self.emit_output("stdout", format!("{line}\n"));
        }
    }

    /// Connect to the VM Service, set up isolate tracking, and complete the
    /// DAP handshake.
    pub async fn connect_to_vm(self: &Arc<Self>, ws_uri: &str) -> DebugResult<()> {
        let vm = VmConnection::connect(ws_uri).await?;

        let (policy, package_map, local_root) = {
            let settings = self.settings.lock().unwrap();
            (
                settings.policy,
                Arc::clone(&settings.package_map),
                settings.local_root.clone(),
            )
        };
        let threads = Arc::new(ThreadManager::new(policy, package_map, local_root));
        *self.connected.lock().unwrap() = Some(Connected {
            vm: vm.clone(),
            threads: Arc::clone(&threads),
        });

        self.emit_custom_event("dart.debuggerUris", json!({"vmServiceUri": ws_uri}));

        // Event pump; also watches for the connection going away.
        let session = Arc::clone(self);
        let mut event_rx = vm.subscribe_events();
        let shutdown = vm.shutdown_token();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = event_rx.recv() => event,
                };
                match event {
                    Ok(event) => session.handle_vm_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "vm event receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            session.handle_vm_disconnect().await;
        });

        // Isolates that existed before we connected never re-announce
        // themselves; sync them up now.
        let vm_info = vm.get_vm().await?;
        if let Some(isolates) = vm_info.get("isolates").and_then(|v| v.as_array()) {
            for isolate_value in isolates {
                let Ok(isolate) = serde_json::from_value::<IsolateRef>(isolate_value.clone())
                else {
                    continue;
                };
                let (num, is_new) = threads.register(&isolate).await;
                if is_new {
                    self.emit_event(
                        "thread",
                        Some(json!({"reason": "started", "threadId": num})),
                    );
                }
                let detail = vm.get_isolate(&isolate.id).await?;
                if detail.pointer("/pauseEvent/kind").and_then(|v| v.as_str())
                    == Some("PauseStart")
                {
                    threads.mark_paused(&isolate.id, true, false, None).await;
                }
                let ready = threads.configure_isolate(&vm, &isolate.id).await?;
                if ready {
                    self.startup_resume(&vm, &threads, num).await;
                }
            }
        }

        // Initial metrics snapshot; refreshed again after each stop.
        for isolate_id in threads.isolate_ids().await {
            if let Ok(memory) = vm.get_memory_usage(&isolate_id).await {
                self.emit_custom_event(
                    "dart.debugMetrics",
                    json!({"isolateId": isolate_id, "memory": memory}),
                );
            }
        }

        self.emit_initialized();
        Ok(())
    }

    /// The VM socket closed. For a launched child this is ambiguous: the
    /// exit notification may still be in flight, so wait briefly before
    /// forcing the process down.
    async fn handle_vm_disconnect(self: &Arc<Self>) {
        if !self.is_attach() && self.child_pid.load(Ordering::SeqCst) != 0 {
            if !self.wait_for_child_exit(VM_CLOSE_GRACE).await {
                if let Err(err) = self.terminate().await {
                    tracing::warn!(error = %err, "termination after vm disconnect failed");
                }
                return;
            }
        }
        self.emit_terminated();
    }

    // ---- vm event handling -------------------------------------------------

    pub async fn handle_vm_event(self: &Arc<Self>, event: VmEvent) {
        let Ok(Connected { vm, threads }) = self.connection() else {
            return;
        };

        match event {
            VmEvent::IsolateStart { isolate } => {
                let (num, is_new) = threads.register(&isolate).await;
                if is_new {
                    self.emit_event(
                        "thread",
                        Some(json!({"reason": "started", "threadId": num})),
                    );
                }
            }
            VmEvent::IsolateRunnable { isolate } => {
                let (num, is_new) = threads.register(&isolate).await;
                if is_new {
                    self.emit_event(
                        "thread",
                        Some(json!({"reason": "started", "threadId": num})),
                    );
                }
                match threads.configure_isolate(&vm, &isolate.id).await {
                    Ok(true) => self.startup_resume(&vm, &threads, num).await,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "isolate configuration failed");
                    }
                }
            }
            VmEvent::IsolateExit { isolate } => {
                if let Some(num) = threads.remove(&isolate.id).await {
                    self.refs.lock().await.purge_thread(num);
                    self.emit_event(
                        "thread",
                        Some(json!({"reason": "exited", "threadId": num})),
                    );
                }
            }
            VmEvent::PauseStart { isolate } => {
                let (num, is_new) = threads.register(&isolate).await;
                if is_new {
                    self.emit_event(
                        "thread",
                        Some(json!({"reason": "started", "threadId": num})),
                    );
                }
                threads.mark_paused(&isolate.id, true, false, None).await;
                if threads.ready_for_startup_resume(&isolate.id).await {
                    self.startup_resume(&vm, &threads, num).await;
                }
            }
            VmEvent::PauseBreakpoint {
                isolate,
                pause_breakpoints,
                at_async_suspension,
            } => {
                self.handle_pause_breakpoint(
                    &vm,
                    &threads,
                    &isolate,
                    pause_breakpoints,
                    at_async_suspension,
                )
                .await;
            }
            VmEvent::PauseException {
                isolate,
                exception,
                at_async_suspension,
            } => {
                let (num, _) = threads.register(&isolate).await;
                threads
                    .mark_paused(&isolate.id, false, at_async_suspension, exception.clone())
                    .await;
                let text = match &exception {
                    Some(exception) => {
                        let marshaler = self.marshaler(&vm, num, &isolate.id);
                        Some(marshaler.full_string(exception).await)
                    }
                    None => None,
                };
                self.emit_stopped(num, "exception", text);
                self.after_stop(num, isolate.id.clone());
            }
            VmEvent::PauseInterrupted {
                isolate,
                at_async_suspension,
            } => {
                let (num, _) = threads.register(&isolate).await;
                threads
                    .mark_paused(&isolate.id, false, at_async_suspension, None)
                    .await;
                self.emit_stopped(num, "pause", None);
                self.after_stop(num, isolate.id.clone());
            }
            VmEvent::PausePostRequest { isolate } => {
                // Post-reload pause: re-apply configuration, then let the
                // isolate run again.
                let (num, _) = threads.register(&isolate).await;
                threads.mark_paused(&isolate.id, false, false, None).await;
                if let Err(err) = threads.configure_isolate(&vm, &isolate.id).await {
                    tracing::warn!(error = %err, "reconfiguration after reload failed");
                }
                if let Err(err) = threads.resume(&vm, num, None).await {
                    tracing::warn!(error = %err, "resume after reload failed");
                }
            }
            VmEvent::PauseExit { isolate } => {
                // Paused right before exit; release it so shutdown completes.
                let (num, _) = threads.register(&isolate).await;
                threads.mark_paused(&isolate.id, false, false, None).await;
                if let Err(err) = threads.resume(&vm, num, None).await {
                    tracing::debug!(error = %err, "resume at exit failed");
                }
            }
            VmEvent::Resume { isolate } => {
                if let Some(num) = threads.mark_running(&isolate.id).await {
                    self.refs.lock().await.purge_thread(num);
                    self.emit_event(
                        "continued",
                        Some(json!({"threadId": num, "allThreadsContinued": false})),
                    );
                }
            }
            VmEvent::ServiceExtensionAdded {
                isolate,
                extension_rpc,
            } => {
                self.emit_custom_event(
                    "dart.serviceExtensionAdded",
                    json!({"extensionRPC": extension_rpc, "isolateId": isolate.id}),
                );
            }
            VmEvent::ServiceRegistered { service, method } => {
                self.emit_custom_event(
                    "dart.serviceRegistered",
                    json!({"service": service, "method": method}),
                );
            }
            VmEvent::Logging { record, .. } => {
                let message = record
                    .pointer("/message/valueAsString")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                self.emit_custom_event("dart.log", json!({"message": message}));
            }
            VmEvent::Unknown { kind } => {
                tracing::debug!(kind, "unhandled vm event");
            }
        }
    }

    async fn handle_pause_breakpoint(
        self: &Arc<Self>,
        vm: &VmConnection,
        threads: &Arc<ThreadManager>,
        isolate: &IsolateRef,
        pause_breakpoints: Vec<dart_vmservice::BreakpointRef>,
        at_async_suspension: bool,
    ) {
        let (num, _) = threads.register(isolate).await;
        threads
            .mark_paused(&isolate.id, false, at_async_suspension, None)
            .await;

        // No breakpoint ids means a completed step.
        if pause_breakpoints.is_empty() {
            self.emit_stopped(num, "step", None);
            self.after_stop(num, isolate.id.clone());
            return;
        }

        // One pause event can carry several breakpoint ids (overlapping
        // client breakpoints at the same location). Classify every one of
        // them: the isolate stays stopped if any wants a stop, and resumes
        // only when none do, after rendering every matched logpoint.
        let mut stop = false;
        let mut log_templates = Vec::new();
        for bp_ref in &pause_breakpoints {
            // A breakpoint id the adapter never set (hot reload can renumber
            // them) is treated as plain and unconditional.
            let Some(client_breakpoint) = threads
                .client_breakpoint_for_vm_id(&isolate.id, &bp_ref.id)
                .await
            else {
                stop = true;
                continue;
            };

            if let Some(condition) = &client_breakpoint.breakpoint.condition {
                match self.evaluate_condition(vm, &isolate.id, condition).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(message) => {
                        // A broken condition stops rather than silently
                        // skipping.
                        self.emit_output(
                            "console",
                            format!("Breakpoint condition {condition:?} failed: {message}\n"),
                        );
                        stop = true;
                        continue;
                    }
                }
            }

            match &client_breakpoint.breakpoint.log_message {
                Some(template) => log_templates.push(template.clone()),
                None => stop = true,
            }
        }

        if stop {
            self.emit_stopped(num, "breakpoint", None);
            self.after_stop(num, isolate.id.clone());
            return;
        }

        for template in log_templates {
            let rendered = self.render_log_message(vm, &isolate.id, &template).await;
            self.emit_output("stdout", format!("{rendered}\n"));
        }
        if let Err(err) = threads.resume(vm, num, None).await {
            tracing::warn!(error = %err, "resume past breakpoint failed");
        }
    }

    async fn startup_resume(&self, vm: &VmConnection, threads: &Arc<ThreadManager>, num: i64) {
        // In attach mode the user asked for a running program, so step onto
        // the first line instead of racing past it.
        let step = self.is_attach().then_some(StepKind::Into);
        match threads.resume(vm, num, step).await {
            Ok(resumed) => {
                if resumed {
                    self.refs.lock().await.purge_thread(num);
                }
            }
            Err(err) => tracing::warn!(error = %err, "startup resume failed"),
        }
    }

    fn emit_stopped(&self, thread_num: i64, reason: &str, text: Option<String>) {
        let mut body = json!({
            "reason": reason,
            "threadId": thread_num,
            "allThreadsStopped": false,
        });
        if let Some(text) = text {
            body["description"] = json!(text.clone());
            body["text"] = json!(text);
        }
        self.emit_event("stopped", Some(body));
    }

    /// Post-stop side channel: memory metrics and (throttled) coverage.
    fn after_stop(self: &Arc<Self>, _thread_num: i64, isolate_id: String) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(Connected { vm, threads }) = session.connection() else {
                return;
            };
            if let Ok(memory) = vm.get_memory_usage(&isolate_id).await {
                session.emit_custom_event(
                    "dart.debugMetrics",
                    json!({"isolateId": isolate_id, "memory": memory}),
                );
            }
            session.emit_coverage(&vm, &threads).await;
        });
    }

    async fn emit_coverage(&self, vm: &VmConnection, threads: &Arc<ThreadManager>) {
        let isolate_ids = threads.isolate_ids().await;
        match self.coverage.collect(vm, &isolate_ids).await {
            Ok(Some(body)) => self.emit_custom_event("dart.coverage", body),
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "coverage collection failed"),
        }
    }

    async fn evaluate_condition(
        &self,
        vm: &VmConnection,
        isolate_id: &str,
        condition: &str,
    ) -> Result<bool, String> {
        let result = tokio::time::timeout(
            EVALUATE_TIMEOUT,
            vm.evaluate_in_frame(isolate_id, 0, condition),
        )
        .await;
        match result {
            Ok(Ok(value)) => Ok(condition_is_truthy(&value)),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("evaluation timed out".to_string()),
        }
    }

    /// Render a logpoint template, evaluating each `{expression}` in the top
    /// frame. `\{` escapes a literal brace.
    async fn render_log_message(
        &self,
        vm: &VmConnection,
        isolate_id: &str,
        template: &str,
    ) -> String {
        let mut out = String::new();
        for part in split_log_message(template) {
            match part {
                LogPart::Text(text) => out.push_str(&text),
                LogPart::Expression(expression) => {
                    let result = tokio::time::timeout(
                        EVALUATE_TIMEOUT,
                        vm.evaluate_in_frame(isolate_id, 0, &expression),
                    )
                    .await;
                    match result {
                        Ok(Ok(value)) => {
                            let text = value
                                .get("valueAsString")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| {
                                    value
                                        .pointer("/class/name")
                                        .and_then(|v| v.as_str())
                                        .map(|name| format!("Instance of '{name}'"))
                                        .unwrap_or_else(|| "<unknown>".to_string())
                                });
                            out.push_str(&text);
                        }
                        Ok(Err(err)) => out.push_str(&format!("<error: {err}>")),
                        Err(_) => out.push_str("<timed out>"),
                    }
                }
            }
        }
        out
    }

    fn marshaler<'a>(
        &'a self,
        vm: &'a VmConnection,
        thread_num: i64,
        isolate_id: &'a str,
    ) -> Marshaler<'a> {
        Marshaler {
            vm,
            refs: &self.refs,
            thread_num,
            isolate_id,
            to_string_enabled: self.settings.lock().unwrap().evaluate_to_string,
        }
    }

    // ---- dap requests ------------------------------------------------------

    pub async fn threads_body(&self) -> DebugResult<Value> {
        // Without a connection (noDebug) the client still polls `threads`.
        let threads = match self.connection() {
            Ok(Connected { threads, .. }) => threads
                .thread_list()
                .await
                .into_iter()
                .map(|(id, name)| json!({"id": id, "name": name}))
                .collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        Ok(json!({ "threads": threads }))
    }

    pub async fn configuration_done(self: &Arc<Self>) -> DebugResult<()> {
        let Ok(Connected { vm, threads }) = self.connection() else {
            return Ok(());
        };
        for num in threads.mark_configuration_done().await {
            self.startup_resume(&vm, &threads, num).await;
        }
        Ok(())
    }

    pub async fn set_breakpoints(&self, arguments: Value) -> DebugResult<Value> {
        let path = arguments
            .pointer("/source/path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DebugError::InvalidRequest("setBreakpoints needs a source path".into()))?;
        let uri = self.path_to_uri(path);

        let requested: Vec<SourceBreakpoint> = arguments
            .get("breakpoints")
            .and_then(|v| v.as_array())
            .map(|bps| {
                bps.iter()
                    .filter_map(|bp| {
                        Some(SourceBreakpoint {
                            line: bp.get("line").and_then(|v| v.as_i64())?,
                            column: bp.get("column").and_then(|v| v.as_i64()),
                            condition: bp
                                .get("condition")
                                .and_then(|v| v.as_str())
                                .filter(|s| !s.trim().is_empty())
                                .map(|s| s.to_string()),
                            log_message: bp
                                .get("logMessage")
                                .and_then(|v| v.as_str())
                                .filter(|s| !s.trim().is_empty())
                                .map(|s| s.to_string()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let breakpoints: Vec<Value> = match self.connection() {
            Ok(Connected { vm, threads }) => threads
                .set_breakpoints(&vm, &uri, requested)
                .await?
                .into_iter()
                .map(|(id, verified)| json!({"id": id, "verified": verified}))
                .collect(),
            // noDebug or not connected yet: acknowledge, verify nothing.
            Err(_) => requested
                .iter()
                .map(|_| json!({"verified": false}))
                .collect(),
        };
        Ok(json!({ "breakpoints": breakpoints }))
    }

    pub async fn set_exception_breakpoints(&self, arguments: Value) -> DebugResult<Value> {
        let filters: Vec<&str> = arguments
            .get("filters")
            .and_then(|v| v.as_array())
            .map(|f| f.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        let mode = if filters.contains(&"All") {
            ExceptionPauseMode::All
        } else if filters.contains(&"Unhandled") {
            ExceptionPauseMode::Unhandled
        } else {
            ExceptionPauseMode::None
        };

        if let Ok(Connected { vm, threads }) = self.connection() {
            threads.set_exception_pause_mode(&vm, mode).await?;
        }
        Ok(json!({}))
    }

    pub async fn stack_trace(&self, arguments: Value) -> DebugResult<Value> {
        let Connected { vm, threads } = self.connection()?;
        let thread_num = arguments
            .get("threadId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DebugError::InvalidRequest("stackTrace needs threadId".into()))?;
        let start_frame = arguments
            .get("startFrame")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as usize;
        let levels = arguments
            .get("levels")
            .and_then(|v| v.as_i64())
            .filter(|&l| l > 0)
            .map(|l| l as usize);

        let isolate = threads.isolate_for_thread(thread_num).await?;
        if !threads.is_paused(thread_num).await {
            return Err(DebugError::InvalidRequest(format!(
                "thread {thread_num} is not paused"
            )));
        }
        let has_exception = threads.exception_for_thread(thread_num).await.is_some();

        let stack = vm.get_stack(&isolate.id).await?;
        let async_frames = stack
            .get("asyncCausalFrames")
            .and_then(|v| v.as_array())
            .filter(|frames| !frames.is_empty());
        let frames: Vec<Value> = async_frames
            .or_else(|| stack.get("frames").and_then(|v| v.as_array()))
            .cloned()
            .unwrap_or_default();

        let total = frames.len();
        let end = levels
            .map(|levels| (start_frame + levels).min(total))
            .unwrap_or(total);

        let mut stack_frames = Vec::new();
        for (position, frame) in frames
            .iter()
            .enumerate()
            .take(end)
            .skip(start_frame)
        {
            if frame.get("kind").and_then(|v| v.as_str()) == Some("AsyncSuspensionMarker") {
                // Even pseudo-frames get a unique id; a client echoing one
                // back resolves to "no scopes" rather than another frame.
                let gap_id = self.refs.lock().await.store(thread_num, StoredData::Label);
                stack_frames.push(json!({
                    "id": gap_id,
                    "name": "<asynchronous gap>",
                    "line": 0,
                    "column": 0,
                    "presentationHint": "label",
                }));
                continue;
            }

            let frame_index = frame.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
            let frame_id = {
                let mut refs = self.refs.lock().await;
                refs.store(
                    thread_num,
                    StoredData::Frame {
                        frame_index,
                        frame: frame.clone(),
                    },
                )
            };

            let name = frame_display_name(frame);
            let (source, line, column) = self
                .frame_source(
                    &vm,
                    &threads,
                    thread_num,
                    &isolate.id,
                    frame,
                    // The top frame of an exception stop is never
                    // deemphasized, even in SDK code.
                    has_exception && position == 0,
                )
                .await;

            let mut entry = json!({
                "id": frame_id,
                "name": name,
                "line": line,
                "column": column,
            });
            if let Some(source) = source {
                entry["source"] = source;
            }
            stack_frames.push(entry);
        }

        Ok(json!({"stackFrames": stack_frames, "totalFrames": total}))
    }

    async fn frame_source(
        &self,
        vm: &VmConnection,
        threads: &Arc<ThreadManager>,
        thread_num: i64,
        isolate_id: &str,
        frame: &Value,
        force_emphasis: bool,
    ) -> (Option<Value>, i64, i64) {
        let Some(location) = frame.get("location") else {
            return (None, 0, 0);
        };
        let script_id = location
            .pointer("/script/id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let uri = location
            .pointer("/script/uri")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let token_pos = location.get("tokenPos").and_then(|v| v.as_i64());

        let (line, column) = match token_pos {
            Some(token_pos) => self
                .script_location(vm, isolate_id, &script_id, token_pos)
                .await
                .unwrap_or((0, 0)),
            None => (0, 0),
        };

        let path = self.uri_to_path(&uri);
        let deemphasize = !force_emphasis && !threads.library_debuggable(&uri);

        let mut source = match path {
            Some(path) => json!({
                "name": path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| uri.clone()),
                "path": path.to_string_lossy(),
            }),
            None => {
                let reference = {
                    let mut refs = self.refs.lock().await;
                    refs.store(
                        thread_num,
                        StoredData::Script {
                            isolate_id: isolate_id.to_string(),
                            script_id: script_id.clone(),
                        },
                    )
                };
                json!({"name": uri, "sourceReference": reference})
            }
        };
        if deemphasize {
            source["presentationHint"] = json!("deemphasize");
        }
        (Some(source), line, column)
    }

    async fn script_location(
        &self,
        vm: &VmConnection,
        isolate_id: &str,
        script_id: &str,
        token_pos: i64,
    ) -> Option<(i64, i64)> {
        let key = (isolate_id.to_string(), script_id.to_string());
        let cached = self.scripts.lock().unwrap().get(&key).cloned();
        let script = match cached {
            Some(script) => script,
            None => {
                let script = vm.get_script(isolate_id, script_id).await.ok()?;
                self.scripts
                    .lock()
                    .unwrap()
                    .insert(key, script.clone());
                script
            }
        };
        script.location_for_token_pos(token_pos)
    }

    pub async fn scopes(&self, arguments: Value) -> DebugResult<Value> {
        let frame_id = arguments
            .get("frameId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DebugError::InvalidRequest("scopes needs frameId".into()))?;

        let mut refs = self.refs.lock().await;
        let (thread_num, data) = refs
            .get(frame_id)
            .cloned()
            .ok_or(DebugError::UnknownFrame(frame_id))?;
        let StoredData::Frame { frame_index, frame } = data else {
            return Err(DebugError::UnknownFrame(frame_id));
        };

        let locals_ref = refs.store(thread_num, StoredData::FrameLocals { frame_index, frame });
        Ok(json!({
            "scopes": [{
                "name": "Locals",
                "variablesReference": locals_ref,
                "expensive": false,
            }],
        }))
    }

    pub async fn variables(&self, arguments: Value) -> DebugResult<Value> {
        let Connected { vm, threads } = self.connection()?;
        let reference = arguments
            .get("variablesReference")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                DebugError::InvalidRequest("variables needs variablesReference".into())
            })?;
        let start = arguments.get("start").and_then(|v| v.as_i64());
        let count = arguments.get("count").and_then(|v| v.as_i64());

        let (thread_num, data) = {
            let refs = self.refs.lock().await;
            refs.get(reference)
                .cloned()
                .ok_or(DebugError::UnknownFrame(reference))?
        };
        let isolate = threads.isolate_for_thread(thread_num).await?;

        let marshaler = self.marshaler(&vm, thread_num, &isolate.id);
        let variables: Vec<Value> = marshaler
            .children(&data, start, count)
            .await
            .into_iter()
            .map(|v| v.into_json())
            .collect();
        Ok(json!({ "variables": variables }))
    }

    pub async fn evaluate(&self, arguments: Value) -> DebugResult<Value> {
        let Connected { vm, threads } = self.connection()?;
        let expression = arguments
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DebugError::InvalidRequest("evaluate needs an expression".into()))?
            .trim()
            .to_string();
        let frame_id = arguments
            .get("frameId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                DebugError::InvalidRequest("evaluation requires a paused frame context".into())
            })?;

        let (thread_num, data) = {
            let refs = self.refs.lock().await;
            refs.get(frame_id)
                .cloned()
                .ok_or(DebugError::UnknownFrame(frame_id))?
        };
        let StoredData::Frame { frame_index, .. } = data else {
            return Err(DebugError::UnknownFrame(frame_id));
        };
        let isolate = threads.isolate_for_thread(thread_num).await?;
        let marshaler = self.marshaler(&vm, thread_num, &isolate.id);

        // `$e` addresses the current exception; `$e.foo` evaluates against it.
        let result = if expression == "$e" || expression.starts_with("$e.") {
            let exception = threads
                .exception_for_thread(thread_num)
                .await
                .ok_or_else(|| {
                    DebugError::InvalidRequest("no current exception for $e".into())
                })?;
            if expression == "$e" {
                exception
            } else {
                let target = exception
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        DebugError::InvalidRequest("exception is not addressable".into())
                    })?;
                let rest = &expression["$e.".len()..];
                timed_evaluate(vm.evaluate(&isolate.id, target, rest)).await?
            }
        } else {
            timed_evaluate(vm.evaluate_in_frame(&isolate.id, frame_index, &expression)).await?
        };

        // The VM reports compile/eval failures as an @Error result rather
        // than an RPC error.
        if matches!(
            result.get("type").and_then(|v| v.as_str()),
            Some("@Error") | Some("Error")
        ) {
            let message = result
                .pointer("/message/valueAsString")
                .or_else(|| result.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("evaluation failed");
            return Err(DebugError::InvalidRequest(message.to_string()));
        }

        let variable = marshaler
            .marshal("result", &result, Some(expression), true)
            .await;
        Ok(json!({
            "result": variable.value,
            "variablesReference": variable.variables_reference,
        }))
    }

    pub async fn continue_thread(&self, arguments: Value) -> DebugResult<Value> {
        self.resume_with(arguments, None).await?;
        Ok(json!({"allThreadsContinued": false}))
    }

    pub async fn next(&self, arguments: Value) -> DebugResult<()> {
        let Connected { threads, .. } = self.connection()?;
        let thread_num = thread_id(&arguments)?;
        // Over an await, plain Over would run to completion instead of the
        // continuation.
        let step = if threads.at_async_suspension(thread_num).await {
            StepKind::OverAsyncSuspension
        } else {
            StepKind::Over
        };
        self.resume_with(arguments, Some(step)).await?;
        Ok(())
    }

    pub async fn step_in(&self, arguments: Value) -> DebugResult<()> {
        self.resume_with(arguments, Some(StepKind::Into)).await?;
        Ok(())
    }

    pub async fn step_out(&self, arguments: Value) -> DebugResult<()> {
        self.resume_with(arguments, Some(StepKind::Out)).await?;
        Ok(())
    }

    async fn resume_with(&self, arguments: Value, step: Option<StepKind>) -> DebugResult<i64> {
        let Connected { vm, threads } = self.connection()?;
        let thread_num = thread_id(&arguments)?;
        if threads.resume(&vm, thread_num, step).await? {
            self.refs.lock().await.purge_thread(thread_num);
        }
        Ok(thread_num)
    }

    pub async fn pause(&self, arguments: Value) -> DebugResult<()> {
        let Connected { vm, threads } = self.connection()?;
        let thread_num = thread_id(&arguments)?;
        let isolate = threads.isolate_for_thread(thread_num).await?;
        vm.pause(&isolate.id).await?;
        Ok(())
    }

    pub async fn source(&self, arguments: Value) -> DebugResult<Value> {
        let Connected { vm, .. } = self.connection()?;
        let reference = arguments
            .get("sourceReference")
            .and_then(|v| v.as_i64())
            .or_else(|| {
                arguments
                    .pointer("/source/sourceReference")
                    .and_then(|v| v.as_i64())
            })
            .ok_or_else(|| DebugError::InvalidRequest("source needs sourceReference".into()))?;

        let (_, data) = {
            let refs = self.refs.lock().await;
            refs.get(reference)
                .cloned()
                .ok_or(DebugError::UnknownFrame(reference))?
        };
        let StoredData::Script {
            isolate_id,
            script_id,
        } = data
        else {
            return Err(DebugError::UnknownFrame(reference));
        };

        let script = vm.get_script(&isolate_id, &script_id).await?;
        Ok(json!({
            "content": script.source.unwrap_or_default(),
            "mimeType": "text/x-dart",
        }))
    }

    // ---- custom requests ---------------------------------------------------

    pub async fn coverage_files_update(&self, arguments: Value) -> DebugResult<Value> {
        let files: Vec<String> = arguments
            .get("files")
            .and_then(|v| v.as_array())
            .map(|files| {
                files
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|path| self.path_to_uri(path))
                    .collect()
            })
            .unwrap_or_default();
        self.coverage.set_tracked_files(files).await;
        Ok(json!({}))
    }

    pub async fn request_coverage_update(&self) -> DebugResult<Value> {
        let Connected { vm, threads } = self.connection()?;
        self.emit_coverage(&vm, &threads).await;
        Ok(json!({}))
    }

    /// Raw VM Service passthrough for registered service methods.
    pub async fn service_call(&self, arguments: Value) -> DebugResult<Value> {
        let Connected { vm, .. } = self.connection()?;
        let method = arguments
            .get("type")
            .or_else(|| arguments.get("method"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| DebugError::InvalidRequest("service needs a method".into()))?;
        let params = arguments.get("params").cloned().unwrap_or(json!({}));
        let result = vm.call_service_extension(method, params).await?;
        Ok(result)
    }

    // ---- teardown ----------------------------------------------------------

    pub async fn disconnect(&self, arguments: Value) -> DebugResult<()> {
        let terminate_debuggee = arguments
            .get("terminateDebuggee")
            .and_then(|v| v.as_bool())
            .unwrap_or(!self.is_attach());
        if terminate_debuggee && !self.is_attach() {
            self.terminate().await
        } else {
            self.detach().await
        }
    }

    /// Graceful shutdown of a launched program: SIGINT first, SIGKILL after
    /// the grace period.
    pub async fn terminate(&self) -> DebugResult<()> {
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid != 0 {
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
            let exited = self.wait_for_child_exit(TERMINATE_GRACE).await;
            if !exited {
                tracing::info!(pid, "child ignored SIGINT, killing");
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
        }
        if let Ok(Connected { vm, .. }) = self.connection() {
            vm.shutdown();
        }
        self.refs.lock().await.clear();
        self.emit_terminated();
        Ok(())
    }

    /// Detach from an attached VM, leaving it in a runnable, breakpoint-free
    /// state. Every step is best-effort and time-bounded; the VM may already
    /// be gone.
    async fn detach(&self) -> DebugResult<()> {
        if let Ok(Connected { vm, threads }) = self.connection() {
            for (isolate_id, breakpoint_id) in threads.all_vm_breakpoints().await {
                let _ = tokio::time::timeout(
                    TEARDOWN_RPC_TIMEOUT,
                    vm.remove_breakpoint(&isolate_id, &breakpoint_id),
                )
                .await;
            }
            for isolate_id in threads.isolate_ids().await {
                let _ = tokio::time::timeout(
                    TEARDOWN_RPC_TIMEOUT,
                    vm.set_exception_pause_mode(&isolate_id, ExceptionPauseMode::None),
                )
                .await;
            }
            for (_, isolate_id) in threads.paused_isolates().await {
                let _ = tokio::time::timeout(
                    TEARDOWN_RPC_TIMEOUT,
                    vm.resume(&isolate_id, None),
                )
                .await;
            }
            vm.shutdown();
        }
        self.refs.lock().await.clear();
        self.emit_terminated();
        Ok(())
    }

    async fn wait_for_child_exit(&self, limit: Duration) -> bool {
        let receiver = self.child_exit.lock().unwrap().clone();
        let Some(mut receiver) = receiver else {
            return true;
        };
        if receiver.borrow().is_some() {
            return true;
        }
        tokio::time::timeout(limit, async {
            while receiver.changed().await.is_ok() {
                if receiver.borrow().is_some() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    // ---- uri helpers -------------------------------------------------------

    /// Map a client-side path (or URI) onto the form the VM knows scripts by.
    pub fn path_to_uri(&self, path: &str) -> String {
        if path.starts_with("package:") || path.starts_with("dart:") || path.starts_with("file:") {
            return path.to_string();
        }
        let settings = self.settings.lock().unwrap();
        if let Some(uri) = settings.package_map.package_uri_for_path(Path::new(path)) {
            return uri;
        }
        format!("file://{path}")
    }

    fn uri_to_path(&self, uri: &str) -> Option<PathBuf> {
        if let Some(path) = uri.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
        if uri.starts_with("package:") {
            let settings = self.settings.lock().unwrap();
            return settings.package_map.resolve(uri);
        }
        None
    }
}

async fn timed_evaluate(
    call: impl std::future::Future<Output = dart_vmservice::Result<Value>>,
) -> DebugResult<Value> {
    match tokio::time::timeout(EVALUATE_TIMEOUT, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DebugError::InvalidRequest(
            "evaluation timed out".to_string(),
        )),
    }
}

fn thread_id(arguments: &Value) -> DebugResult<i64> {
    arguments
        .get("threadId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| DebugError::InvalidRequest("request needs threadId".into()))
}

fn frame_display_name(frame: &Value) -> String {
    let function = frame
        .pointer("/function/name")
        .and_then(|v| v.as_str())
        .unwrap_or("<unknown>");
    match frame
        .pointer("/function/owner/name")
        .and_then(|v| v.as_str())
    {
        Some(owner) if !owner.is_empty() => format!("{owner}.{function}"),
        _ => function.to_string(),
    }
}

/// True when an evaluation result counts as a satisfied breakpoint condition:
/// boolean `true`, or any non-zero integer.
pub fn condition_is_truthy(result: &Value) -> bool {
    let kind = result.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let value = result
        .get("valueAsString")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match kind {
        "Bool" => value == "true",
        "Int" => value.parse::<i64>().map(|n| n != 0).unwrap_or(false),
        _ => false,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LogPart {
    Text(String),
    Expression(String),
}

/// Split a logpoint template into literal text and `{expression}` parts.
fn split_log_message(template: &str) -> Vec<LogPart> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some('{') | Some('}')) => {
                text.push(chars.next().unwrap());
            }
            '{' => {
                let mut expression = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    expression.push(inner);
                }
                if closed && !expression.trim().is_empty() {
                    if !text.is_empty() {
                        parts.push(LogPart::Text(std::mem::take(&mut text)));
                    }
                    parts.push(LogPart::Expression(expression.trim().to_string()));
                } else {
                    // Unterminated or empty braces render literally.
                    text.push('{');
                    text.push_str(&expression);
                    if closed {
                        text.push('}');
                    }
                }
            }
            c => text.push(c),
        }
    }
    if !text.is_empty() {
        parts.push(LogPart::Text(text));
    }
    parts
}

/// Extract the VM Service URI from a stdout banner line, if present.
pub fn parse_vm_service_banner(line: &str) -> Option<String> {
    for banner in VM_SERVICE_BANNERS {
        if let Some(index) = line.find(banner) {
            let uri = line[index + banner.len()..].trim();
            if !uri.is_empty() {
                return Some(uri.to_string());
            }
        }
    }
    None
}
