//! A tiny VM Service endpoint used for unit/integration testing.
//!
//! It intentionally supports a *small* subset of the protocol sufficient to
//! exercise `dart-vmservice` and `dart-dap` without requiring a Dart SDK to
//! be installed on the system.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

/// Scripted isolate state served by the mock.
#[derive(Clone, Debug)]
pub struct MockIsolate {
    pub id: String,
    pub name: String,
    pub paused: bool,
}

impl MockIsolate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            paused: false,
        }
    }

    fn as_ref_json(&self) -> Value {
        json!({"type": "@Isolate", "id": self.id, "name": self.name})
    }
}

#[derive(Clone, Debug)]
pub struct MockVmServiceConfig {
    /// Initial isolates reported by `getVM`.
    pub isolates: Vec<MockIsolate>,
    /// When enabled, a successful `resume` automatically emits the matching
    /// `Resume` event on the Debug stream (the real VM does this).
    pub auto_resume_events: bool,
    /// Script URI reported for the default script `scripts/1`.
    pub script_uri: String,
}

impl Default for MockVmServiceConfig {
    fn default() -> Self {
        Self {
            isolates: vec![MockIsolate::new("isolates/1", "main")],
            auto_resume_events: true,
            script_uri: "package:app/main.dart".to_string(),
        }
    }
}

#[derive(Default)]
struct State {
    calls: Mutex<Vec<(String, Value)>>,
    isolates: Mutex<Vec<MockIsolate>>,
    responses: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, (i64, String)>>,
    objects: Mutex<HashMap<String, Value>>,
    breakpoints: Mutex<Vec<(String, String, i64)>>,
}

/// A mock VM Service websocket server.
pub struct MockVmService {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
    config: MockVmServiceConfig,
    events: broadcast::Sender<String>,
    next_breakpoint: Arc<AtomicU64>,
}

impl MockVmService {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockVmServiceConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockVmServiceConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State::default());
        *state.isolates.lock().await = config.isolates.clone();
        let (events, _) = broadcast::channel(64);
        let next_breakpoint = Arc::new(AtomicU64::new(1));

        let server = Self {
            addr,
            shutdown: shutdown.clone(),
            state: state.clone(),
            config: config.clone(),
            events: events.clone(),
            next_breakpoint: next_breakpoint.clone(),
        };

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = listener.accept() => res,
                };
                let Ok((stream, _peer)) = accepted else { break };
                let Ok(socket) = accept_async(stream).await else { continue };

                tokio::spawn(serve_connection(
                    socket,
                    state.clone(),
                    config.clone(),
                    events.clone(),
                    next_breakpoint.clone(),
                    shutdown.clone(),
                ));
            }
        });

        Ok(server)
    }

    pub fn ws_uri(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Push an event onto a stream, exactly as the VM would.
    pub fn send_event(&self, stream_id: &str, event: Value) {
        let message = json!({
            "jsonrpc": "2.0",
            "method": "streamNotify",
            "params": {"streamId": stream_id, "event": event},
        });
        let _ = self.events.send(message.to_string());
    }

    pub fn send_isolate_event(&self, kind: &str, isolate_id: &str, name: &str) {
        self.send_event(
            "Isolate",
            json!({
                "kind": kind,
                "isolate": {"type": "@Isolate", "id": isolate_id, "name": name},
            }),
        );
    }

    pub fn send_pause_event(&self, kind: &str, isolate_id: &str, extra: Value) {
        let mut event = json!({
            "kind": kind,
            "isolate": {"type": "@Isolate", "id": isolate_id, "name": "main"},
        });
        if let (Some(obj), Some(extra)) = (event.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.send_event("Debug", event);
    }

    /// Force a canned successful result for `method`.
    pub async fn set_response(&self, method: &str, result: Value) {
        self.state
            .responses
            .lock()
            .await
            .insert(method.to_string(), result);
    }

    /// Script the object returned by `getObject` for one object id.
    pub async fn set_object(&self, object_id: &str, object: Value) {
        self.state
            .objects
            .lock()
            .await
            .insert(object_id.to_string(), object);
    }

    /// Force an RPC error for `method`.
    pub async fn fail_method(&self, method: &str, code: i64, message: &str) {
        self.state
            .failures
            .lock()
            .await
            .insert(method.to_string(), (code, message.to_string()));
    }

    /// All recorded `(method, params)` calls, in order.
    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().await.clone()
    }

    pub async fn calls_of(&self, method: &str) -> Vec<Value> {
        self.state
            .calls
            .lock()
            .await
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub async fn call_count(&self, method: &str) -> usize {
        self.calls_of(method).await.len()
    }

    /// VM-side breakpoints currently installed: `(breakpoint id, script uri, line)`.
    pub async fn breakpoints(&self) -> Vec<(String, String, i64)> {
        self.state.breakpoints.lock().await.clone()
    }

    pub async fn set_isolate_paused(&self, isolate_id: &str, paused: bool) {
        let mut isolates = self.state.isolates.lock().await;
        if let Some(isolate) = isolates.iter_mut().find(|i| i.id == isolate_id) {
            isolate.paused = paused;
        }
    }
}

async fn serve_connection(
    socket: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    state: Arc<State>,
    config: MockVmServiceConfig,
    events: broadcast::Sender<String>,
    next_breakpoint: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    // Forward both responses and injected events through one writer task so
    // message order on the wire is well defined.
    let forward_shutdown = shutdown.clone();
    let mut event_rx = events.subscribe();
    let event_out = out_tx.clone();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = forward_shutdown.cancelled() => break,
                msg = event_rx.recv() => msg,
            };
            match message {
                Ok(msg) => {
                    if event_out.send(msg).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let writer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                msg = out_rx.recv() => msg,
            };
            let Some(message) = message else { break };
            if sink.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = stream.next() => msg,
        };
        let Some(Ok(Message::Text(text))) = message else {
            match message {
                Some(Ok(_)) => continue,
                _ => break,
            }
        };

        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        let params = request.get("params").cloned().unwrap_or(json!({}));

        state.calls.lock().await.push((method.clone(), params.clone()));

        if let Some((code, message)) = state.failures.lock().await.get(&method).cloned() {
            let _ = out_tx.send(error_response(&id, code, &message).to_string());
            continue;
        }
        if let Some(result) = state.responses.lock().await.get(&method).cloned() {
            let _ = out_tx.send(success_response(&id, result).to_string());
            continue;
        }

        let reply = handle_request(
            &state,
            &config,
            &events,
            &next_breakpoint,
            &method,
            &params,
        )
        .await;
        let message = match reply {
            Ok(result) => success_response(&id, result),
            Err((code, message)) => error_response(&id, code, &message),
        };
        let _ = out_tx.send(message.to_string());
    }
}

async fn handle_request(
    state: &State,
    config: &MockVmServiceConfig,
    events: &broadcast::Sender<String>,
    next_breakpoint: &AtomicU64,
    method: &str,
    params: &Value,
) -> Result<Value, (i64, String)> {
    let isolate_id = params.get("isolateId").and_then(|v| v.as_str()).unwrap_or("");

    match method {
        "streamListen" | "setExceptionPauseMode" | "setLibraryDebuggable" => {
            Ok(json!({"type": "Success"}))
        }
        "getVM" => {
            let isolates = state.isolates.lock().await;
            let refs: Vec<Value> = isolates.iter().map(|i| i.as_ref_json()).collect();
            Ok(json!({"type": "VM", "name": "vm", "isolates": refs}))
        }
        "getIsolate" => {
            let isolates = state.isolates.lock().await;
            let Some(isolate) = isolates.iter().find(|i| i.id == isolate_id) else {
                return Err((105, format!("isolate {isolate_id} not found")));
            };
            let pause_kind = if isolate.paused { "PauseStart" } else { "Resume" };
            Ok(json!({
                "type": "Isolate",
                "id": isolate.id,
                "name": isolate.name,
                "runnable": true,
                "pauseEvent": {"kind": pause_kind, "isolate": isolate.as_ref_json()},
                "rootLib": {"type": "@Library", "id": "libraries/1", "uri": config.script_uri},
                "libraries": [
                    {"type": "@Library", "id": "libraries/1", "uri": config.script_uri},
                    {"type": "@Library", "id": "libraries/2", "uri": "dart:core"},
                ],
            }))
        }
        "getScripts" => Ok(json!({
            "type": "ScriptList",
            "scripts": [{"type": "@Script", "id": "scripts/1", "uri": config.script_uri}],
        })),
        "addBreakpointWithScriptUri" => {
            let uri = params
                .get("scriptUri")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let line = params.get("line").and_then(|v| v.as_i64()).unwrap_or(0);
            let number = next_breakpoint.fetch_add(1, Ordering::Relaxed);
            let bp_id = format!("breakpoints/{number}");
            state
                .breakpoints
                .lock()
                .await
                .push((bp_id.clone(), uri.clone(), line));
            Ok(json!({
                "type": "Breakpoint",
                "id": bp_id,
                "resolved": true,
                "location": {
                    "script": {"type": "@Script", "id": "scripts/1", "uri": uri},
                    "tokenPos": line * 10,
                },
            }))
        }
        "removeBreakpoint" => {
            let bp_id = params
                .get("breakpointId")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            state.breakpoints.lock().await.retain(|(id, _, _)| id != bp_id);
            Ok(json!({"type": "Success"}))
        }
        "resume" => {
            let mut isolates = state.isolates.lock().await;
            let Some(isolate) = isolates.iter_mut().find(|i| i.id == isolate_id) else {
                return Err((105, format!("isolate {isolate_id} not found")));
            };
            if !isolate.paused {
                return Err((106, "Isolate must be paused".to_string()));
            }
            isolate.paused = false;
            if config.auto_resume_events {
                let message = json!({
                    "jsonrpc": "2.0",
                    "method": "streamNotify",
                    "params": {
                        "streamId": "Debug",
                        "event": {"kind": "Resume", "isolate": isolate.as_ref_json()},
                    },
                });
                let _ = events.send(message.to_string());
            }
            Ok(json!({"type": "Success"}))
        }
        "pause" => {
            let mut isolates = state.isolates.lock().await;
            if let Some(isolate) = isolates.iter_mut().find(|i| i.id == isolate_id) {
                isolate.paused = true;
                let message = json!({
                    "jsonrpc": "2.0",
                    "method": "streamNotify",
                    "params": {
                        "streamId": "Debug",
                        "event": {"kind": "PauseInterrupted", "isolate": isolate.as_ref_json()},
                    },
                });
                let _ = events.send(message.to_string());
            }
            Ok(json!({"type": "Success"}))
        }
        "getStack" => Ok(json!({
            "type": "Stack",
            "frames": [{
                "index": 0,
                "function": {"type": "@Function", "name": "main"},
                "location": {
                    "script": {"type": "@Script", "id": "scripts/1", "uri": config.script_uri},
                    "tokenPos": 100,
                },
                "vars": [
                    {"name": "x", "value": {"kind": "Int", "id": "objects/1", "valueAsString": "42"}},
                ],
            }],
            "asyncCausalFrames": [],
        })),
        "getObject" => {
            let object_id = params.get("objectId").and_then(|v| v.as_str()).unwrap_or("");
            if let Some(object) = state.objects.lock().await.get(object_id).cloned() {
                return Ok(object);
            }
            if object_id.starts_with("scripts/") {
                // Token position table: one token per line, tokenPos = line * 10.
                let table: Vec<Value> = (1..=100)
                    .map(|line: i64| json!([line, line * 10, 1]))
                    .collect();
                return Ok(json!({
                    "type": "Script",
                    "id": object_id,
                    "uri": config.script_uri,
                    "source": "void main() {}\n",
                    "tokenPosTable": table,
                }));
            }
            Err((104, format!("object {object_id} not found")))
        }
        "evaluateInFrame" | "evaluate" => {
            let expression = params
                .get("expression")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            match eval_expression(expression) {
                Some(result) => Ok(result),
                None => Err((-32000, format!("cannot evaluate {expression:?}"))),
            }
        }
        "invoke" => Ok(json!({
            "kind": "String",
            "id": "objects/tostring",
            "valueAsString": "Instance of 'Object'",
        })),
        "getSourceReport" => Ok(json!({
            "type": "SourceReport",
            "ranges": [{
                "scriptIndex": 0,
                "compiled": true,
                "coverage": {"hits": [100, 110], "misses": [120]},
            }],
            "scripts": [{"type": "@Script", "id": "scripts/1", "uri": config.script_uri}],
        })),
        "getMemoryUsage" => Ok(json!({
            "type": "MemoryUsage",
            "heapUsage": 1024,
            "heapCapacity": 4096,
            "externalUsage": 0,
        })),
        _ => Err((-32601, format!("method not found: {method}"))),
    }
}

/// A deliberately tiny expression evaluator: integer literals, `a+b` integer
/// addition, and boolean literals. Enough for conditional-breakpoint and
/// evaluate tests.
fn eval_expression(expression: &str) -> Option<Value> {
    let expr = expression.trim();
    if expr == "true" || expr == "false" {
        return Some(json!({
            "kind": "Bool",
            "id": "objects/bool",
            "valueAsString": expr,
        }));
    }
    if let Ok(n) = expr.parse::<i64>() {
        return Some(int_instance(n));
    }
    if let Some((lhs, rhs)) = expr.split_once('+') {
        let lhs: i64 = lhs.trim().parse().ok()?;
        let rhs: i64 = rhs.trim().parse().ok()?;
        return Some(int_instance(lhs + rhs));
    }
    None
}

fn int_instance(n: i64) -> Value {
    json!({
        "kind": "Int",
        "id": "objects/int",
        "valueAsString": n.to_string(),
    })
}

fn success_response(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
