use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    ExceptionPauseMode, Result, Script, SourceReport, StepKind, VmEvent, VmServiceError,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone)]
pub struct VmConnectionConfig {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub event_channel_size: usize,
}

impl Default for VmConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(15),
            event_channel_size: 256,
        }
    }
}

#[derive(Debug)]
struct Inner {
    writer: Mutex<WsSink>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<VmEvent>,
    shutdown: CancellationToken,
    config: VmConnectionConfig,
}

/// A live connection to a Dart VM Service endpoint.
///
/// Cloning is cheap; all clones share one websocket. Outgoing calls are
/// correlated by a monotonically increasing integer id; a call that never
/// receives a response is retained only until it times out or the
/// connection closes, at which point its waiter is rejected.
#[derive(Clone)]
pub struct VmConnection {
    inner: Arc<Inner>,
}

impl VmConnection {
    pub async fn connect(ws_uri: &str) -> Result<Self> {
        Self::connect_with_config(ws_uri, VmConnectionConfig::default()).await
    }

    pub async fn connect_with_config(ws_uri: &str, config: VmConnectionConfig) -> Result<Self> {
        let (socket, _response) =
            tokio::time::timeout(config.connect_timeout, connect_async(ws_uri))
                .await
                .map_err(|_| VmServiceError::Timeout)??;

        let (writer, reader) = socket.split();
        let (events, _) = broadcast::channel(config.event_channel_size);

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        let client = Self { inner };
        for stream in ["Isolate", "Debug", "Service", "Logging"] {
            client.stream_listen(stream).await?;
        }

        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// A token that is cancelled when the connection shuts down, either
    /// explicitly via [`VmConnection::shutdown`] or implicitly when the
    /// websocket closes.
    ///
    /// The DAP session controller watches this to decide whether the target
    /// went away (and whether the session should terminate).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VmEvent> {
        self.inner.events.subscribe()
    }

    /// Issue a JSON-RPC call and await its correlated response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let message = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": params,
        });

        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.send(Message::Text(message.to_string())).await {
                self.remove_pending(id).await;
                return Err(err.into());
            }
        }

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                Err(VmServiceError::ConnectionClosed)
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(_closed)) => Err(VmServiceError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        Err(VmServiceError::Timeout)
                    }
                }
            }
        }
    }

    async fn remove_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    pub async fn stream_listen(&self, stream_id: &str) -> Result<()> {
        let _ = self.call("streamListen", json!({"streamId": stream_id})).await?;
        Ok(())
    }

    pub async fn get_vm(&self) -> Result<Value> {
        self.call("getVM", json!({})).await
    }

    pub async fn get_isolate(&self, isolate_id: &str) -> Result<Value> {
        self.call("getIsolate", json!({"isolateId": isolate_id})).await
    }

    pub async fn get_object(
        &self,
        isolate_id: &str,
        object_id: &str,
        offset: Option<i64>,
        count: Option<i64>,
    ) -> Result<Value> {
        let mut params = json!({"isolateId": isolate_id, "objectId": object_id});
        if let Some(offset) = offset {
            params["offset"] = json!(offset);
        }
        if let Some(count) = count {
            params["count"] = json!(count);
        }
        self.call("getObject", params).await
    }

    /// Fetch a full [`Script`] object, including its token position table.
    pub async fn get_script(&self, isolate_id: &str, script_id: &str) -> Result<Script> {
        let value = self.get_object(isolate_id, script_id, None, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_scripts(&self, isolate_id: &str) -> Result<Value> {
        self.call("getScripts", json!({"isolateId": isolate_id})).await
    }

    pub async fn get_stack(&self, isolate_id: &str) -> Result<Value> {
        self.call("getStack", json!({"isolateId": isolate_id})).await
    }

    pub async fn add_breakpoint_with_script_uri(
        &self,
        isolate_id: &str,
        script_uri: &str,
        line: i64,
        column: Option<i64>,
    ) -> Result<Value> {
        let mut params = json!({
            "isolateId": isolate_id,
            "scriptUri": script_uri,
            "line": line,
        });
        if let Some(column) = column {
            params["column"] = json!(column);
        }
        self.call("addBreakpointWithScriptUri", params).await
    }

    pub async fn remove_breakpoint(&self, isolate_id: &str, breakpoint_id: &str) -> Result<()> {
        let _ = self
            .call(
                "removeBreakpoint",
                json!({"isolateId": isolate_id, "breakpointId": breakpoint_id}),
            )
            .await?;
        Ok(())
    }

    pub async fn resume(&self, isolate_id: &str, step: Option<StepKind>) -> Result<()> {
        let mut params = json!({"isolateId": isolate_id});
        if let Some(step) = step {
            params["step"] = json!(step.as_str());
        }
        let _ = self.call("resume", params).await?;
        Ok(())
    }

    pub async fn pause(&self, isolate_id: &str) -> Result<()> {
        let _ = self.call("pause", json!({"isolateId": isolate_id})).await?;
        Ok(())
    }

    pub async fn set_exception_pause_mode(
        &self,
        isolate_id: &str,
        mode: ExceptionPauseMode,
    ) -> Result<()> {
        let _ = self
            .call(
                "setExceptionPauseMode",
                json!({"isolateId": isolate_id, "mode": mode.as_str()}),
            )
            .await?;
        Ok(())
    }

    pub async fn set_library_debuggable(
        &self,
        isolate_id: &str,
        library_id: &str,
        is_debuggable: bool,
    ) -> Result<()> {
        let _ = self
            .call(
                "setLibraryDebuggable",
                json!({
                    "isolateId": isolate_id,
                    "libraryId": library_id,
                    "isDebuggable": is_debuggable,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn evaluate(
        &self,
        isolate_id: &str,
        target_id: &str,
        expression: &str,
    ) -> Result<Value> {
        self.call(
            "evaluate",
            json!({
                "isolateId": isolate_id,
                "targetId": target_id,
                "expression": expression,
            }),
        )
        .await
    }

    pub async fn evaluate_in_frame(
        &self,
        isolate_id: &str,
        frame_index: i64,
        expression: &str,
    ) -> Result<Value> {
        self.call(
            "evaluateInFrame",
            json!({
                "isolateId": isolate_id,
                "frameIndex": frame_index,
                "expression": expression,
            }),
        )
        .await
    }

    /// Invoke a zero-argument method (typically `toString`) on a target.
    pub async fn invoke(
        &self,
        isolate_id: &str,
        target_id: &str,
        selector: &str,
    ) -> Result<Value> {
        self.call(
            "invoke",
            json!({
                "isolateId": isolate_id,
                "targetId": target_id,
                "selector": selector,
                "argumentIds": [],
            }),
        )
        .await
    }

    pub async fn get_source_report(
        &self,
        isolate_id: &str,
        script_id: &str,
    ) -> Result<SourceReport> {
        let value = self
            .call(
                "getSourceReport",
                json!({
                    "isolateId": isolate_id,
                    "scriptId": script_id,
                    "reports": ["Coverage"],
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_memory_usage(&self, isolate_id: &str) -> Result<Value> {
        self.call("getMemoryUsage", json!({"isolateId": isolate_id})).await
    }

    /// Raw passthrough used by the DAP `service` custom request.
    pub async fn call_service_extension(&self, method: &str, params: Value) -> Result<Value> {
        self.call(method, params).await
    }
}

async fn read_loop(mut reader: WsStream, inner: Arc<Inner>) {
    loop {
        let message = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            msg = reader.next() => msg,
        };

        let message = match message {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                tracing::debug!(error = %err, "vm service websocket read failed");
                break;
            }
            None => break,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(_) => break,
            // Ping/pong are handled by tungstenite itself.
            _ => continue,
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed vm service message");
                continue;
            }
        };

        dispatch_message(&inner, value).await;
    }

    inner.shutdown.cancel();

    // Reject every in-flight call so no waiter leaks past connection close.
    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_id, tx) in pending {
        let _ = tx.send(Err(VmServiceError::ConnectionClosed));
    }
}

async fn dispatch_message(inner: &Inner, value: Value) {
    if let Some(id) = value.get("id").and_then(parse_correlation_id) {
        let tx = {
            let mut pending = inner.pending.lock().await;
            pending.remove(&id)
        };
        let Some(tx) = tx else {
            // Response to a call we already abandoned (timeout). Discard.
            return;
        };

        let reply = if let Some(error) = value.get("error") {
            Err(VmServiceError::Rpc {
                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(reply);
        return;
    }

    if value.get("method").and_then(|m| m.as_str()) == Some("streamNotify") {
        let Some(event) = value.pointer("/params/event") else {
            return;
        };
        match VmEvent::parse(event) {
            Ok(VmEvent::Unknown { kind }) => {
                tracing::debug!(kind, "ignoring unknown vm service event kind");
            }
            Ok(event) => {
                // Receivers run on their own tasks; sending never blocks the
                // read loop.
                let _ = inner.events.send(event);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode vm service event");
            }
        }
    }
}

fn parse_correlation_id(id: &Value) -> Option<u64> {
    match id {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Rewrite an HTTP(S) VM Service URI (as printed in the process banner) to
/// its websocket form.
pub fn http_uri_to_ws(uri: &str) -> String {
    let mut out = if let Some(rest) = uri.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = uri.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        uri.to_string()
    };

    if !out.ends_with("/ws") {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str("ws");
    }
    out
}
