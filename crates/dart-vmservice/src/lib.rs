//! Dart VM Service client.
//!
//! The VM Service (historically "Observatory") is the Dart runtime's
//! JSON-RPC-over-websocket introspection and control protocol. `dart-dap`
//! consumes this crate to talk to the target VM: issuing RPCs, subscribing to
//! event streams, and decoding the handful of response shapes the adapter
//! cares about (isolates, breakpoints, source reports).
//!
//! The client is deliberately thin: most payloads stay `serde_json::Value`
//! and the adapter interprets them; only stable shapes (events, source
//! reports, scripts) get typed structs.

mod client;

#[cfg(any(test, feature = "mock-test-support"))]
pub mod mock;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use client::{http_uri_to_ws, VmConnection, VmConnectionConfig};

/// RPC error code: the isolate must be paused for this request (also returned
/// for a resume of an already-running isolate).
pub const ERROR_ISOLATE_MUST_BE_PAUSED: i64 = 106;

pub type Result<T> = std::result::Result<T, VmServiceError>;

#[derive(Debug, Error)]
pub enum VmServiceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("vm service rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("vm service request timed out")]
    Timeout,

    #[error("vm service connection closed")]
    ConnectionClosed,

    #[error("vm service protocol error: {0}")]
    Protocol(String),
}

impl VmServiceError {
    /// True when the error is the VM telling us the isolate already resumed
    /// (or was never paused). Teardown and restart paths tolerate this.
    pub fn is_isolate_must_be_paused(&self) -> bool {
        matches!(self, Self::Rpc { code, .. } if *code == ERROR_ISOLATE_MUST_BE_PAUSED)
    }
}

/// A reference to a VM isolate: the opaque service id plus its display name.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct IsolateRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "isSystemIsolate")]
    pub is_system_isolate: bool,
}

/// A reference to a VM-side breakpoint as it appears in pause events.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BreakpointRef {
    pub id: String,
}

/// Step kinds accepted by the VM `resume` RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
    /// Resume from an async suspension point (`await`) to the continuation.
    OverAsyncSuspension,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Into => "Into",
            Self::Over => "Over",
            Self::Out => "Out",
            Self::OverAsyncSuspension => "OverAsyncSuspension",
        }
    }
}

/// Exception pause modes accepted by `setExceptionPauseMode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExceptionPauseMode {
    #[default]
    None,
    Unhandled,
    All,
}

impl ExceptionPauseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Unhandled => "Unhandled",
            Self::All => "All",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "None" => Some(Self::None),
            "Unhandled" => Some(Self::Unhandled),
            "All" => Some(Self::All),
            _ => None,
        }
    }
}

/// Decoded VM Service stream event.
///
/// This is a closed enum: kinds the adapter does not understand land in
/// [`VmEvent::Unknown`] so new VM versions degrade to a logged no-op instead
/// of a decode failure.
#[derive(Clone, Debug)]
pub enum VmEvent {
    IsolateStart {
        isolate: IsolateRef,
    },
    IsolateRunnable {
        isolate: IsolateRef,
    },
    IsolateExit {
        isolate: IsolateRef,
    },
    PauseStart {
        isolate: IsolateRef,
    },
    PauseBreakpoint {
        isolate: IsolateRef,
        pause_breakpoints: Vec<BreakpointRef>,
        at_async_suspension: bool,
    },
    PauseException {
        isolate: IsolateRef,
        exception: Option<Value>,
        at_async_suspension: bool,
    },
    PauseInterrupted {
        isolate: IsolateRef,
        at_async_suspension: bool,
    },
    PausePostRequest {
        isolate: IsolateRef,
    },
    PauseExit {
        isolate: IsolateRef,
    },
    Resume {
        isolate: IsolateRef,
    },
    ServiceExtensionAdded {
        isolate: IsolateRef,
        extension_rpc: String,
    },
    ServiceRegistered {
        service: String,
        method: String,
    },
    Logging {
        isolate: IsolateRef,
        record: Value,
    },
    Unknown {
        kind: String,
    },
}

impl VmEvent {
    /// Decode a `streamNotify` event body.
    pub fn parse(event: &Value) -> Result<Self> {
        let kind = event
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| VmServiceError::Protocol("event missing kind".to_string()))?;

        let isolate = || -> Result<IsolateRef> {
            let isolate = event
                .get("isolate")
                .cloned()
                .ok_or_else(|| VmServiceError::Protocol(format!("{kind} event missing isolate")))?;
            Ok(serde_json::from_value(isolate)?)
        };
        let at_async_suspension = event
            .get("atAsyncSuspension")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(match kind {
            "IsolateStart" => Self::IsolateStart { isolate: isolate()? },
            "IsolateRunnable" => Self::IsolateRunnable { isolate: isolate()? },
            "IsolateExit" => Self::IsolateExit { isolate: isolate()? },
            "PauseStart" => Self::PauseStart { isolate: isolate()? },
            "PauseBreakpoint" => {
                let pause_breakpoints = event
                    .get("pauseBreakpoints")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|bp| serde_json::from_value(bp.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                Self::PauseBreakpoint {
                    isolate: isolate()?,
                    pause_breakpoints,
                    at_async_suspension,
                }
            }
            "PauseException" => Self::PauseException {
                isolate: isolate()?,
                exception: event.get("exception").cloned(),
                at_async_suspension,
            },
            "PauseInterrupted" => Self::PauseInterrupted {
                isolate: isolate()?,
                at_async_suspension,
            },
            "PausePostRequest" => Self::PausePostRequest { isolate: isolate()? },
            "PauseExit" => Self::PauseExit { isolate: isolate()? },
            "Resume" => Self::Resume { isolate: isolate()? },
            "ServiceExtensionAdded" => Self::ServiceExtensionAdded {
                isolate: isolate()?,
                extension_rpc: event
                    .get("extensionRPC")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "ServiceRegistered" => Self::ServiceRegistered {
                service: event
                    .get("service")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                method: event
                    .get("method")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "Logging" => Self::Logging {
                isolate: isolate()?,
                record: event.get("logRecord").cloned().unwrap_or(Value::Null),
            },
            other => Self::Unknown {
                kind: other.to_string(),
            },
        })
    }

    /// The isolate the event concerns, if it carries one.
    pub fn isolate(&self) -> Option<&IsolateRef> {
        match self {
            Self::IsolateStart { isolate }
            | Self::IsolateRunnable { isolate }
            | Self::IsolateExit { isolate }
            | Self::PauseStart { isolate }
            | Self::PauseBreakpoint { isolate, .. }
            | Self::PauseException { isolate, .. }
            | Self::PauseInterrupted { isolate, .. }
            | Self::PausePostRequest { isolate }
            | Self::PauseExit { isolate }
            | Self::Resume { isolate }
            | Self::ServiceExtensionAdded { isolate, .. }
            | Self::Logging { isolate, .. } => Some(isolate),
            Self::ServiceRegistered { .. } | Self::Unknown { .. } => None,
        }
    }
}

/// A script reference as it appears in source reports and isolate listings.
#[derive(Clone, Debug, Deserialize)]
pub struct ScriptRef {
    pub id: String,
    #[serde(default)]
    pub uri: String,
}

/// Coverage hits/misses for a single source report range, in token positions.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SourceReportCoverage {
    #[serde(default)]
    pub hits: Vec<i64>,
    #[serde(default)]
    pub misses: Vec<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SourceReportRange {
    #[serde(rename = "scriptIndex")]
    pub script_index: usize,
    #[serde(default)]
    pub compiled: bool,
    #[serde(default)]
    pub coverage: Option<SourceReportCoverage>,
}

/// A VM source report: token-level coverage per script range.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceReport {
    #[serde(default)]
    pub ranges: Vec<SourceReportRange>,
    #[serde(default)]
    pub scripts: Vec<ScriptRef>,
}

/// A full script object, including the token position table used to map
/// token positions back to line/column.
///
/// `token_pos_table` rows are `[lineNumber, (tokenPos, column)*]`.
#[derive(Clone, Debug, Deserialize)]
pub struct Script {
    pub id: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, rename = "tokenPosTable")]
    pub token_pos_table: Vec<Vec<i64>>,
}

impl Script {
    /// Resolve a token position to a 1-based line number by scanning the
    /// token position table.
    pub fn line_for_token_pos(&self, token_pos: i64) -> Option<i64> {
        self.location_for_token_pos(token_pos).map(|(line, _)| line)
    }

    /// Resolve a token position to a 1-based `(line, column)` pair.
    pub fn location_for_token_pos(&self, token_pos: i64) -> Option<(i64, i64)> {
        for row in &self.token_pos_table {
            let Some((&line, positions)) = row.split_first() else {
                continue;
            };
            for pair in positions.chunks(2) {
                if pair.first() == Some(&token_pos) {
                    return Some((line, pair.get(1).copied().unwrap_or(1)));
                }
            }
        }
        None
    }
}
