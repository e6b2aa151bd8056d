//! Launch-mode tests. A shell script stands in for the `dart` binary: it
//! prints the VM Service banner (pointing at the mock) and then idles, so the
//! adapter exercises the real spawn / banner-scan / signal paths.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use serde_json::json;

use super::start_adapter;

/// Create a throwaway SDK layout whose `bin/dart` runs the given script body.
fn fake_sdk(name: &str, script_body: &str) -> PathBuf {
    let sdk = std::env::temp_dir().join(format!("dart-dap-fake-sdk-{}-{name}", std::process::id()));
    let bin = sdk.join("bin");
    fs::create_dir_all(&bin).expect("create fake sdk");
    let dart = bin.join("dart");
    fs::write(&dart, format!("#!/bin/sh\n{script_body}\n")).expect("write fake dart");
    fs::set_permissions(&dart, fs::Permissions::from_mode(0o755)).expect("chmod fake dart");
    sdk
}

#[tokio::test(flavor = "multi_thread")]
async fn launch_connects_via_the_stdout_banner() {
    let mut fixture = start_adapter().await;
    let sdk = fake_sdk(
        "banner",
        &format!(
            "echo \"The Dart VM service is listening on {}\"\nexec sleep 60",
            fixture.server.ws_uri()
        ),
    );

    fixture.client.initialize().await;
    fixture
        .client
        .request_ok(
            "launch",
            json!({
                "program": "app.dart",
                "dartSdkPath": sdk.to_string_lossy(),
            }),
        )
        .await;

    // The handshake completes only once the banner led us to the VM.
    fixture.client.expect_event("initialized").await;
    let thread = fixture.client.expect_event("thread").await;
    assert_eq!(thread["body"]["reason"], "started");

    let uris = fixture.client.expect_event("dart.debuggerUris").await;
    assert_eq!(uris["body"]["vmServiceUri"], fixture.server.ws_uri());

    // The banner line itself is adapter-internal and never forwarded.
    assert!(fixture.client.pending_events("output").is_empty());

    fixture
        .client
        .request_ok("terminate", json!({}))
        .await;
    fixture.client.expect_event("exited").await;
    fixture.client.expect_event("terminated").await;
    fixture.server.shutdown();
    let _ = fs::remove_dir_all(&sdk);
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_socket_close_with_live_child_ends_the_session() {
    let mut fixture = start_adapter().await;
    let sdk = fake_sdk(
        "vmclose",
        &format!(
            "echo \"The Dart VM service is listening on {}\"\nexec sleep 60",
            fixture.server.ws_uri()
        ),
    );

    fixture.client.initialize().await;
    fixture
        .client
        .request_ok(
            "launch",
            json!({
                "program": "app.dart",
                "dartSdkPath": sdk.to_string_lossy(),
            }),
        )
        .await;
    fixture.client.expect_event("initialized").await;
    fixture.client.expect_event("thread").await;

    // The VM side goes away while the child still runs. The session waits
    // out the exit grace, then takes the child down itself.
    fixture.server.shutdown();

    fixture.client.expect_event("exited").await;
    fixture.client.expect_event("terminated").await;
    let _ = fs::remove_dir_all(&sdk);
}

#[tokio::test(flavor = "multi_thread")]
async fn no_debug_launch_runs_to_completion() {
    let mut fixture = start_adapter().await;
    let sdk = fake_sdk("nodebug", "echo hello\nexit 0");

    fixture.client.initialize().await;
    fixture
        .client
        .request_ok(
            "launch",
            json!({
                "program": "app.dart",
                "dartSdkPath": sdk.to_string_lossy(),
                "noDebug": true,
            }),
        )
        .await;

    // No VM to wait for: the handshake completes immediately.
    fixture.client.expect_event("initialized").await;

    let output = fixture.client.expect_event("output").await;
    assert_eq!(output["body"]["category"], "stdout");
    assert_eq!(output["body"]["output"], "hello\n");

    let exited = fixture.client.expect_event("exited").await;
    assert_eq!(exited["body"]["exitCode"], 0);
    fixture.client.expect_event("terminated").await;

    // Breakpoints are acknowledged but never verified without a VM.
    let body = fixture
        .client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": {"path": "/tmp/app.dart"},
                "breakpoints": [{"line": 3}],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], false);

    fixture.server.shutdown();
    let _ = fs::remove_dir_all(&sdk);
}
