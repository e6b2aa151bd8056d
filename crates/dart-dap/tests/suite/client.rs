//! A minimal DAP client driving the adapter over an in-memory pipe, plus the
//! mock VM Service the adapter talks to on the other side.

use std::collections::VecDeque;
use std::time::Duration;

use dart_dap::dap::{DapReader, DapWriter};
use dart_vmservice::mock::{MockVmService, MockVmServiceConfig};
use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DapClient {
    reader: DapReader<ReadHalf<DuplexStream>>,
    writer: DapWriter<WriteHalf<DuplexStream>>,
    next_seq: i64,
    /// Events received but not yet consumed by `expect_event`.
    pending: VecDeque<Value>,
    /// Every event ever received, in arrival order.
    pub event_log: Vec<Value>,
}

impl DapClient {
    pub fn new(reader: ReadHalf<DuplexStream>, writer: WriteHalf<DuplexStream>) -> Self {
        Self {
            reader: DapReader::new(reader),
            writer: DapWriter::new(writer),
            next_seq: 0,
            pending: VecDeque::new(),
            event_log: Vec::new(),
        }
    }

    async fn read_message(&mut self) -> Value {
        tokio::time::timeout(IO_TIMEOUT, self.reader.read_value())
            .await
            .expect("timed out waiting for a dap message")
            .expect("dap read failed")
            .expect("dap stream closed")
    }

    fn record_event(&mut self, message: Value) {
        self.event_log.push(message.clone());
        self.pending.push_back(message);
    }

    /// Send a request and await its response, buffering any events that
    /// arrive in between.
    pub async fn request(&mut self, command: &str, arguments: Value) -> Value {
        self.next_seq += 1;
        let seq = self.next_seq;
        let message = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.writer.write_value(&message).await.expect("dap write");

        loop {
            let message = self.read_message().await;
            match message.get("type").and_then(|v| v.as_str()) {
                Some("event") => self.record_event(message),
                Some("response")
                    if message.get("request_seq").and_then(|v| v.as_i64()) == Some(seq) =>
                {
                    return message;
                }
                _ => {}
            }
        }
    }

    /// Send a request and assert it succeeded, returning the body.
    pub async fn request_ok(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments).await;
        assert_eq!(
            response.get("success").and_then(|v| v.as_bool()),
            Some(true),
            "request {command:?} failed: {response}"
        );
        response.get("body").cloned().unwrap_or(Value::Null)
    }

    pub async fn request_err(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments).await;
        assert_eq!(
            response.get("success").and_then(|v| v.as_bool()),
            Some(false),
            "request {command:?} unexpectedly succeeded: {response}"
        );
        response
    }

    fn take_pending(&mut self, name: &str) -> Option<Value> {
        let index = self
            .pending
            .iter()
            .position(|e| e.get("event").and_then(|v| v.as_str()) == Some(name))?;
        self.pending.remove(index)
    }

    /// Wait until an event with the given name arrives (or was already
    /// buffered) and return it.
    pub async fn expect_event(&mut self, name: &str) -> Value {
        if let Some(event) = self.take_pending(name) {
            return event;
        }
        loop {
            let message = self.read_message().await;
            if message.get("type").and_then(|v| v.as_str()) == Some("event") {
                self.record_event(message);
                if let Some(event) = self.take_pending(name) {
                    return event;
                }
            }
        }
    }

    /// Buffered (unconsumed) events with the given name.
    pub fn pending_events(&self, name: &str) -> Vec<&Value> {
        self.pending
            .iter()
            .filter(|e| e.get("event").and_then(|v| v.as_str()) == Some(name))
            .collect()
    }

    /// Position of the first occurrence of an event in the arrival log.
    pub fn event_index(&self, name: &str) -> Option<usize> {
        self.event_log
            .iter()
            .position(|e| e.get("event").and_then(|v| v.as_str()) == Some(name))
    }

    pub async fn initialize(&mut self) -> Value {
        self.request_ok("initialize", json!({"adapterID": "dart"}))
            .await
    }

    pub async fn attach(&mut self, ws_uri: &str) {
        self.request_ok("attach", json!({"vmServiceUri": ws_uri}))
            .await;
        self.expect_event("initialized").await;
    }
}

pub struct TestAdapter {
    pub client: DapClient,
    pub server: MockVmService,
}

pub async fn start_adapter() -> TestAdapter {
    start_adapter_with_config(MockVmServiceConfig::default()).await
}

pub async fn start_adapter_with_config(config: MockVmServiceConfig) -> TestAdapter {
    let server = MockVmService::spawn_with_config(config)
        .await
        .expect("mock vm service");

    let (client_io, adapter_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(adapter_io);
        let _ = dart_dap::server::run(reader, writer).await;
    });

    let (reader, writer) = tokio::io::split(client_io);
    TestAdapter {
        client: DapClient::new(reader, writer),
        server,
    }
}
