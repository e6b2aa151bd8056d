//! End-to-end adapter tests: a scripted DAP client on one side, the mock VM
//! Service on the other.

use std::time::Duration;

use dart_vmservice::mock::{MockIsolate, MockVmService, MockVmServiceConfig};
use serde_json::json;

use super::{start_adapter, start_adapter_with_config};

async fn wait_for_calls(server: &MockVmService, method: &str, at_least: usize) {
    for _ in 0..500 {
        if server.call_count(method).await >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {at_least} {method:?} calls");
}

#[tokio::test(flavor = "multi_thread")]
async fn attach_handshake_reports_threads() {
    let mut fixture = start_adapter().await;
    let capabilities = fixture.client.initialize().await;
    assert_eq!(capabilities["supportsConfigurationDoneRequest"], true);
    assert_eq!(capabilities["supportsLogPoints"], true);

    fixture.client.attach(&fixture.server.ws_uri()).await;
    let thread_event = fixture.client.expect_event("thread").await;
    assert_eq!(thread_event["body"]["reason"], "started");
    assert_eq!(thread_event["body"]["threadId"], 1);

    let body = fixture.client.request_ok("threads", json!({})).await;
    assert_eq!(body["threads"][0]["id"], 1);
    assert_eq!(body["threads"][0]["name"], "main");
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_events_are_held_until_initialized() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;

    // dart.debuggerUris is raised during connect, before the handshake
    // completes, and must be replayed after `initialized`.
    let uris = fixture.client.expect_event("dart.debuggerUris").await;
    assert!(uris["body"]["vmServiceUri"]
        .as_str()
        .unwrap()
        .starts_with("ws://"));

    let initialized = fixture.client.event_index("initialized").unwrap();
    let debugger_uris = fixture.client.event_index("dart.debuggerUris").unwrap();
    assert!(initialized < debugger_uris);
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn isolate_registration_is_idempotent() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture.client.expect_event("thread").await;

    fixture
        .server
        .send_isolate_event("IsolateStart", "isolates/2", "worker");
    fixture
        .server
        .send_isolate_event("IsolateStart", "isolates/2", "worker");
    // Sentinel event so we know both IsolateStarts were processed.
    fixture.server.send_event(
        "Service",
        json!({"kind": "ServiceRegistered", "service": "s", "method": "m"}),
    );

    let started = fixture.client.expect_event("thread").await;
    assert_eq!(started["body"]["threadId"], 2);
    fixture.client.expect_event("dart.serviceRegistered").await;
    assert!(fixture.client.pending_events("thread").is_empty());
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn breakpoint_stop_exposes_stack_variables_and_evaluation() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;

    let body = fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [{"line": 10}],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], true);
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseBreakpoint",
        "isolates/1",
        json!({"pauseBreakpoints": [{"id": "breakpoints/1"}]}),
    );

    let stopped = fixture.client.expect_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["threadId"], 1);
    assert_eq!(stopped["body"]["allThreadsStopped"], false);

    // Memory metrics follow every stop.
    let metrics = fixture.client.expect_event("dart.debugMetrics").await;
    assert_eq!(metrics["body"]["memory"]["heapUsage"], 1024);

    // tokenPos 100 maps to line 10 in the mock's token table.
    let stack = fixture
        .client
        .request_ok("stackTrace", json!({"threadId": 1}))
        .await;
    let frame = &stack["stackFrames"][0];
    assert_eq!(frame["name"], "main");
    assert_eq!(frame["line"], 10);
    let source_ref = frame["source"]["sourceReference"].as_i64().unwrap();
    assert!(source_ref > 0);
    assert_eq!(frame["source"]["name"], "package:app/main.dart");

    let source = fixture
        .client
        .request_ok("source", json!({"sourceReference": source_ref}))
        .await;
    assert_eq!(source["content"], "void main() {}\n");

    let frame_id = frame["id"].as_i64().unwrap();
    let scopes = fixture
        .client
        .request_ok("scopes", json!({"frameId": frame_id}))
        .await;
    assert_eq!(scopes["scopes"][0]["name"], "Locals");

    let locals_ref = scopes["scopes"][0]["variablesReference"].as_i64().unwrap();
    let variables = fixture
        .client
        .request_ok("variables", json!({"variablesReference": locals_ref}))
        .await;
    assert_eq!(variables["variables"][0]["name"], "x");
    assert_eq!(variables["variables"][0]["value"], "42");

    let result = fixture
        .client
        .request_ok(
            "evaluate",
            json!({"expression": "1+1", "frameId": frame_id}),
        )
        .await;
    assert_eq!(result["result"], "2");
    assert_eq!(result["variablesReference"], 0);
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn false_breakpoint_condition_resumes_silently() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [{"line": 10, "condition": "false"}],
            }),
        )
        .await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseBreakpoint",
        "isolates/1",
        json!({"pauseBreakpoints": [{"id": "breakpoints/1"}]}),
    );

    wait_for_calls(&fixture.server, "resume", 1).await;
    let conditions = fixture.server.calls_of("evaluateInFrame").await;
    assert_eq!(conditions[0]["expression"], "false");

    // Drain anything in flight, then confirm no stop was reported.
    fixture.client.request_ok("threads", json!({})).await;
    assert!(fixture.client.pending_events("stopped").is_empty());
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn true_breakpoint_condition_stops() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [{"line": 10, "condition": "true"}],
            }),
        )
        .await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseBreakpoint",
        "isolates/1",
        json!({"pauseBreakpoints": [{"id": "breakpoints/1"}]}),
    );

    let stopped = fixture.client.expect_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(fixture.server.call_count("resume").await, 0);
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_breakpoint_id_stops_unconditionally() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseBreakpoint",
        "isolates/1",
        json!({"pauseBreakpoints": [{"id": "breakpoints/99"}]}),
    );

    let stopped = fixture.client.expect_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    // No condition lookup happened for a breakpoint we never set.
    assert_eq!(fixture.server.call_count("evaluateInFrame").await, 0);
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn sibling_unconditional_breakpoint_still_stops() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [{"line": 10, "condition": "false"}, {"line": 10}],
            }),
        )
        .await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    // The VM reports both breakpoints in one pause event. The false
    // condition alone must not run past the plain one.
    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseBreakpoint",
        "isolates/1",
        json!({"pauseBreakpoints": [{"id": "breakpoints/1"}, {"id": "breakpoints/2"}]}),
    );

    let stopped = fixture.client.expect_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(fixture.server.call_count("resume").await, 0);
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_sibling_breakpoint_forces_a_stop() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [{"line": 10, "condition": "false"}],
            }),
        )
        .await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    // One id resolves to a false condition, the other was never set by the
    // adapter; the unknown one counts as unconditional.
    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseBreakpoint",
        "isolates/1",
        json!({"pauseBreakpoints": [{"id": "breakpoints/1"}, {"id": "breakpoints/99"}]}),
    );

    let stopped = fixture.client.expect_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(fixture.server.call_count("resume").await, 0);
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn every_matched_logpoint_prints_before_resuming() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [
                    {"line": 10, "logMessage": "a is {1+1}"},
                    {"line": 10, "logMessage": "b is {2+2}"},
                ],
            }),
        )
        .await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseBreakpoint",
        "isolates/1",
        json!({"pauseBreakpoints": [{"id": "breakpoints/1"}, {"id": "breakpoints/2"}]}),
    );

    let first = fixture.client.expect_event("output").await;
    assert_eq!(first["body"]["output"], "a is 2\n");
    let second = fixture.client.expect_event("output").await;
    assert_eq!(second["body"]["output"], "b is 4\n");

    wait_for_calls(&fixture.server, "resume", 1).await;
    fixture.client.request_ok("threads", json!({})).await;
    assert!(fixture.client.pending_events("stopped").is_empty());
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn logpoints_print_and_resume() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [{"line": 10, "logMessage": "i is {1+1}"}],
            }),
        )
        .await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseBreakpoint",
        "isolates/1",
        json!({"pauseBreakpoints": [{"id": "breakpoints/1"}]}),
    );

    let output = fixture.client.expect_event("output").await;
    assert_eq!(output["body"]["output"], "i is 2\n");

    wait_for_calls(&fixture.server, "resume", 1).await;
    fixture.client.request_ok("threads", json!({})).await;
    assert!(fixture.client.pending_events("stopped").is_empty());
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_references_become_invalid_after_resume() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture
        .server
        .send_pause_event("PauseInterrupted", "isolates/1", json!({}));
    fixture.client.expect_event("stopped").await;

    let stack = fixture
        .client
        .request_ok("stackTrace", json!({"threadId": 1}))
        .await;
    let frame_id = stack["stackFrames"][0]["id"].as_i64().unwrap();
    let scopes = fixture
        .client
        .request_ok("scopes", json!({"frameId": frame_id}))
        .await;
    let locals_ref = scopes["scopes"][0]["variablesReference"].as_i64().unwrap();

    let body = fixture
        .client
        .request_ok("continue", json!({"threadId": 1}))
        .await;
    assert_eq!(body["allThreadsContinued"], false);

    // The handle was purged with the resume and is never reissued.
    fixture
        .client
        .request_err("variables", json!({"variablesReference": locals_ref}))
        .await;
    fixture
        .client
        .request_err("scopes", json!({"frameId": frame_id}))
        .await;
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_resume_is_gated_on_configuration_done() {
    let config = MockVmServiceConfig {
        isolates: vec![MockIsolate {
            id: "isolates/1".to_string(),
            name: "main".to_string(),
            paused: true,
        }],
        ..Default::default()
    };
    let mut fixture = start_adapter_with_config(config).await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture.client.expect_event("thread").await;

    // Paused on start, configuration still open: the isolate stays held.
    assert_eq!(fixture.server.call_count("resume").await, 0);

    fixture.client.request_ok("configurationDone", json!({})).await;
    wait_for_calls(&fixture.server, "resume", 1).await;

    // Attach-mode startup steps onto the first line instead of running past.
    let resumes = fixture.server.calls_of("resume").await;
    assert_eq!(resumes[0]["step"], "Into");
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn exception_pauses_carry_text_and_support_dollar_e() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture.server.send_pause_event(
        "PauseException",
        "isolates/1",
        json!({"exception": {"kind": "String", "id": "objects/e", "valueAsString": "oops"}}),
    );

    let stopped = fixture.client.expect_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "exception");
    assert!(stopped["body"]["text"].as_str().unwrap().contains("oops"));

    let stack = fixture
        .client
        .request_ok("stackTrace", json!({"threadId": 1}))
        .await;
    let frame_id = stack["stackFrames"][0]["id"].as_i64().unwrap();
    let result = fixture
        .client
        .request_ok("evaluate", json!({"expression": "$e", "frameId": frame_id}))
        .await;
    assert!(result["result"].as_str().unwrap().contains("oops"));
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn exception_filter_selection_reaches_the_vm() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;

    fixture
        .client
        .request_ok("setExceptionBreakpoints", json!({"filters": ["All"]}))
        .await;
    let modes = fixture.server.calls_of("setExceptionPauseMode").await;
    assert!(modes.iter().any(|p| p["mode"] == "All"));

    fixture
        .client
        .request_ok("setExceptionBreakpoints", json!({"filters": []}))
        .await;
    let modes = fixture.server.calls_of("setExceptionPauseMode").await;
    assert!(modes.iter().any(|p| p["mode"] == "None"));
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_request_interrupts_the_isolate() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture.client.request_ok("pause", json!({"threadId": 1})).await;
    let stopped = fixture.client.expect_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "pause");
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_pause_reinstalls_breakpoints_and_resumes() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [{"line": 10}],
            }),
        )
        .await;
    fixture.client.request_ok("configurationDone", json!({})).await;
    assert_eq!(fixture.server.call_count("addBreakpointWithScriptUri").await, 1);

    // A post-reload pause re-applies configuration and resumes without
    // surfacing a stop.
    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture
        .server
        .send_pause_event("PausePostRequest", "isolates/1", json!({}));

    wait_for_calls(&fixture.server, "resume", 1).await;
    wait_for_calls(&fixture.server, "addBreakpointWithScriptUri", 2).await;
    assert!(fixture.server.call_count("removeBreakpoint").await >= 1);

    // A second reload arriving after something else already resumed the
    // isolate: the VM answers "must be paused" and the adapter shrugs.
    fixture
        .server
        .send_pause_event("PausePostRequest", "isolates/1", json!({}));
    wait_for_calls(&fixture.server, "resume", 2).await;

    fixture.client.request_ok("threads", json!({})).await;
    assert!(fixture.client.pending_events("stopped").is_empty());
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn async_gaps_get_distinct_frame_ids() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture
        .server
        .set_response(
            "getStack",
            json!({
                "type": "Stack",
                "frames": [],
                "asyncCausalFrames": [
                    {
                        "index": 0,
                        "function": {"type": "@Function", "name": "inner"},
                        "location": {
                            "script": {"type": "@Script", "id": "scripts/1", "uri": "package:app/main.dart"},
                            "tokenPos": 100,
                        },
                    },
                    {"kind": "AsyncSuspensionMarker"},
                    {
                        "index": 1,
                        "function": {"type": "@Function", "name": "outer"},
                        "location": {
                            "script": {"type": "@Script", "id": "scripts/1", "uri": "package:app/main.dart"},
                            "tokenPos": 110,
                        },
                    },
                    {"kind": "AsyncSuspensionMarker"},
                ],
            }),
        )
        .await;

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture
        .server
        .send_pause_event("PauseInterrupted", "isolates/1", json!({}));
    fixture.client.expect_event("stopped").await;

    let stack = fixture
        .client
        .request_ok("stackTrace", json!({"threadId": 1}))
        .await;
    let frames = stack["stackFrames"].as_array().unwrap();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[1]["name"], "<asynchronous gap>");
    assert_eq!(frames[1]["presentationHint"], "label");
    assert_eq!(frames[3]["name"], "<asynchronous gap>");

    // Every frame id, gap frames included, is positive and unique.
    let ids: Vec<i64> = frames
        .iter()
        .map(|f| f["id"].as_i64().unwrap())
        .collect();
    assert!(ids.iter().all(|&id| id > 0));
    let mut deduped = ids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len());

    // A gap frame resolves to no scopes.
    fixture
        .client
        .request_err("scopes", json!({"frameId": frames[1]["id"]}))
        .await;
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn detach_restores_the_target() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "package:app/main.dart"},
                "breakpoints": [{"line": 10}],
            }),
        )
        .await;
    fixture.client.request_ok("configurationDone", json!({})).await;
    assert_eq!(fixture.server.breakpoints().await.len(), 1);

    fixture.server.set_isolate_paused("isolates/1", true).await;
    fixture
        .server
        .send_pause_event("PauseInterrupted", "isolates/1", json!({}));
    fixture.client.expect_event("stopped").await;

    let stack = fixture
        .client
        .request_ok("stackTrace", json!({"threadId": 1}))
        .await;
    let frame_id = stack["stackFrames"][0]["id"].as_i64().unwrap();

    fixture.client.request_ok("disconnect", json!({})).await;
    fixture.client.expect_event("terminated").await;

    assert!(fixture.server.breakpoints().await.is_empty());
    let modes = fixture.server.calls_of("setExceptionPauseMode").await;
    assert!(modes.iter().any(|p| p["mode"] == "None"));
    assert!(fixture.server.call_count("resume").await >= 1);

    // Teardown purged every stored handle.
    fixture
        .client
        .request_err("scopes", json!({"frameId": frame_id}))
        .await;
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn coverage_reports_hit_and_missed_lines() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;
    fixture.client.request_ok("configurationDone", json!({})).await;

    fixture
        .client
        .request_ok(
            "coverageFilesUpdate",
            json!({"files": ["package:app/main.dart"]}),
        )
        .await;
    fixture
        .client
        .request_ok("requestCoverageUpdate", json!({}))
        .await;

    let coverage = fixture.client.expect_event("dart.coverage").await;
    let entry = &coverage["body"]["coverage"][0];
    assert_eq!(entry["scriptUri"], "package:app/main.dart");
    assert_eq!(entry["hitLines"], json!([10, 11]));
    assert_eq!(entry["missedLines"], json!([12]));
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn service_request_passes_through_to_the_vm() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    fixture.client.attach(&fixture.server.ws_uri()).await;

    let body = fixture
        .client
        .request_ok("service", json!({"method": "getVM"}))
        .await;
    assert!(body["isolates"].as_array().is_some());
    fixture.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_commands_fail_cleanly() {
    let mut fixture = start_adapter().await;
    fixture.client.initialize().await;
    let response = fixture.client.request_err("restart", json!({})).await;
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("unsupported command"));
    fixture.server.shutdown();
}
