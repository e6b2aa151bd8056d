//! The DAP server loop: frames requests off the transport, dispatches them to
//! the [`DebugSession`], and serializes responses and events back out through
//! a single writer task.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::{
    dap::{make_event, make_response, DapReader, DapWriter, Request},
    error::DebugResult,
    session::{DebugSession, OutgoingEvent},
};

/// Run the adapter over stdio. Returns when the client closes its end.
pub async fn run_stdio() -> std::io::Result<()> {
    run(tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the adapter over an arbitrary transport. Used directly by tests, which
/// drive the adapter through an in-memory duplex pipe.
pub async fn run<R, W>(reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<OutgoingEvent>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let seq = Arc::new(AtomicI64::new(0));
    let session = Arc::new(DebugSession::new(event_tx));

    // Single writer: everything on the wire goes through here so framing is
    // never interleaved.
    let mut dap_writer = DapWriter::new(writer);
    tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            if let Err(err) = dap_writer.write_value(&value).await {
                tracing::debug!(error = %err, "dap write failed");
                break;
            }
        }
    });

    // Session events → DAP event messages.
    let event_out = out_tx.clone();
    let event_seq = Arc::clone(&seq);
    tokio::spawn(async move {
        while let Some(OutgoingEvent { event, body }) = event_rx.recv().await {
            let message = make_event(event_seq.fetch_add(1, Ordering::SeqCst) + 1, event, body);
            let Ok(value) = serde_json::to_value(&message) else {
                continue;
            };
            if event_out.send(value).is_err() {
                break;
            }
        }
    });

    let mut dap_reader = DapReader::new(reader);
    loop {
        let request = match dap_reader.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read dap request");
                break;
            }
        };

        // Requests are handled concurrently; a slow stackTrace must not block
        // a pause request. Response order is tied to request_seq, not arrival.
        let session = Arc::clone(&session);
        let out_tx = out_tx.clone();
        let seq = Arc::clone(&seq);
        tokio::spawn(async move {
            tracing::debug!(command = %request.command, seq = request.seq, "dap request");
            let (success, body, message) = match dispatch(&session, &request).await {
                Ok(body) => (true, body, None),
                Err(err) => (false, None, Some(err.to_string())),
            };
            let response = make_response(
                seq.fetch_add(1, Ordering::SeqCst) + 1,
                &request,
                success,
                body,
                message,
            );
            if let Ok(value) = serde_json::to_value(&response) {
                let _ = out_tx.send(value);
            }
        });
    }
    Ok(())
}

async fn dispatch(session: &Arc<DebugSession>, request: &Request) -> DebugResult<Option<Value>> {
    let args = request.arguments.clone();
    match request.command.as_str() {
        "initialize" => Ok(Some(capabilities())),
        "launch" => {
            session.launch(args).await?;
            Ok(None)
        }
        "attach" => {
            session.attach(args).await?;
            Ok(None)
        }
        "setBreakpoints" => session.set_breakpoints(args).await.map(Some),
        "setExceptionBreakpoints" => session.set_exception_breakpoints(args).await.map(Some),
        "configurationDone" => {
            session.configuration_done().await?;
            Ok(None)
        }
        "threads" => session.threads_body().await.map(Some),
        "stackTrace" => session.stack_trace(args).await.map(Some),
        "scopes" => session.scopes(args).await.map(Some),
        "variables" => session.variables(args).await.map(Some),
        "evaluate" => session.evaluate(args).await.map(Some),
        "continue" => session.continue_thread(args).await.map(Some),
        "next" => {
            session.next(args).await?;
            Ok(None)
        }
        "stepIn" => {
            session.step_in(args).await?;
            Ok(None)
        }
        "stepOut" => {
            session.step_out(args).await?;
            Ok(None)
        }
        "pause" => {
            session.pause(args).await?;
            Ok(None)
        }
        "source" => session.source(args).await.map(Some),
        "disconnect" => {
            session.disconnect(args).await?;
            Ok(None)
        }
        "terminate" => {
            session.terminate().await?;
            Ok(None)
        }
        "coverageFilesUpdate" => session.coverage_files_update(args).await.map(Some),
        "requestCoverageUpdate" => session.request_coverage_update().await.map(Some),
        "service" => session.service_call(args).await.map(Some),
        other => Err(crate::error::DebugError::InvalidRequest(format!(
            "unsupported command {other:?}"
        ))),
    }
}

fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsConditionalBreakpoints": true,
        "supportsLogPoints": true,
        "supportsEvaluateForHovers": true,
        "supportsTerminateRequest": true,
        "supportsDelayedStackTraceLoading": true,
        "exceptionBreakpointFilters": [
            {
                "filter": "All",
                "label": "All Exceptions",
                "default": false,
            },
            {
                "filter": "Unhandled",
                "label": "Uncaught Exceptions",
                "default": true,
            },
        ],
    })
}
