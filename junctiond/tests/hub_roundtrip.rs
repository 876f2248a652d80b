#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use junction_common::config::HubConfig;
use junction_common::endpoints::{Channel, Endpoints};
use junction_common::framing::next_line;
use junction_common::protocol::{ListenerEvent, LogLevel, StepStatus};
use junctiond::hub::RunSummary;
use junctiond::tap::ListenerSink;
use junctiond::Hub;
use junctiond_client::{HubClient, ListenerRelay, LogRelay};

// in-flight frames settle well within this on loopback
const SETTLE: Duration = Duration::from_millis(150);

fn test_config(dir: &Path) -> HubConfig {
    HubConfig {
        runtime_dir: Some(dir.to_path_buf()),
        progress_bar: false,
        ..HubConfig::default()
    }
}

fn start_hub(config: HubConfig) -> (Endpoints, JoinHandle<anyhow::Result<RunSummary>>) {
    let hub = Hub::bind(config).expect("bind hub");
    let endpoints = hub.endpoints().clone();
    let handle = tokio::spawn(hub.run());
    (endpoints, handle)
}

#[tokio::test]
async fn step_signature_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    client
        .set_step_signature("step1", json!("abc"))
        .await
        .expect("set signature");
    client.commit_signatures().await.expect("commit");
    sleep(SETTLE).await;

    assert_eq!(
        client.step_signature("step1").await.expect("get"),
        json!("abc")
    );
    assert_eq!(
        client.step_signature("missing").await.expect("get absent"),
        Value::Null
    );

    client.done(true).await.expect("done");
    handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn workflow_facts_roundtrip_and_clear() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    client
        .write_workflow_fact("wf1", "tracked_file", json!({"file": "a.txt"}))
        .await
        .expect("write fact");
    client
        .write_workflow_fact("wf1", "placeholder", json!({"file": "b.txt"}))
        .await
        .expect("write placeholder");
    client
        .write_workflow_fact("wf2", "tracked_file", json!({"file": "c.txt"}))
        .await
        .expect("write other workflow");
    client.commit_signatures().await.expect("commit");
    sleep(SETTLE).await;

    let records = client.workflow_records("wf1").await.expect("records");
    assert_eq!(records.as_array().map(Vec::len), Some(2));
    let placeholders = client
        .workflow_placeholders("wf1")
        .await
        .expect("placeholders");
    assert_eq!(placeholders, json!([{"file": "b.txt"}]));

    assert_eq!(
        client.clear_workflow_facts().await.expect("clear"),
        json!("ok")
    );
    let records = client.workflow_records("wf1").await.expect("records");
    assert_eq!(records, json!([]));

    client.done(true).await.expect("done");
    handle.await.expect("join").expect("run");
}

// replies on one request socket come back 1:1 in request order, even when
// requests are pipelined
#[tokio::test]
async fn request_replies_preserve_fifo_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    for i in 0..5 {
        client
            .set_step_signature(&format!("s{i}"), json!(format!("sig-{i}")))
            .await
            .expect("set signature");
    }
    sleep(SETTLE).await;

    let stream = UnixStream::connect(endpoints.socket(Channel::SignatureReq).expect("path"))
        .await
        .expect("raw connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut batch = String::new();
    for i in 0..5 {
        batch.push_str(&format!(
            "{{\"type\":\"step_get\",\"step_id\":\"s{i}\"}}\n"
        ));
    }
    write_half.write_all(batch.as_bytes()).await.expect("write");
    write_half.flush().await.expect("flush");

    for i in 0..5 {
        let raw = next_line(&mut reader)
            .await
            .expect("read reply")
            .expect("reply line");
        assert_eq!(raw, format!("\"sig-{i}\""));
    }

    client.done(true).await.expect("done");
    handle.await.expect("join").expect("run");
}

// a malformed or unknown request must still get a reply (the null sentinel)
#[tokio::test]
async fn malformed_requests_are_answered_with_null() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    for channel in [Channel::SignatureReq, Channel::ControlReq] {
        let stream = UnixStream::connect(endpoints.socket(channel).expect("path"))
            .await
            .expect("raw connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(b"this is not json\n{\"type\":\"frobnicate\"}\n")
            .await
            .expect("write garbage");
        write_half.flush().await.expect("flush");

        for _ in 0..2 {
            let raw = next_line(&mut reader)
                .await
                .expect("read reply")
                .expect("reply line");
            assert_eq!(raw, "null");
        }
    }

    // the hub must still be fully functional afterwards
    assert_eq!(client.active_procs().await.expect("nprocs"), 0);
    client.done(true).await.expect("done");
    handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn nprocs_defaults_to_zero_and_tracks_pushes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    assert_eq!(client.active_procs().await.expect("nprocs"), 0);

    client.set_active_procs(3).await.expect("push nprocs");
    sleep(SETTLE).await;
    assert_eq!(client.active_procs().await.expect("nprocs"), 3);

    client.done(true).await.expect("done");
    handle.await.expect("join").expect("run");
}

// every event pushed before `done` is reflected in the final summary
#[tokio::test]
async fn drain_completes_before_done_is_acknowledged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    client.substep_completed("a_1").await.expect("progress");
    client.substep_completed("a_1").await.expect("progress");
    client.substep_completed("a_2").await.expect("progress");
    client.substep_ignored("a_1").await.expect("progress");
    client.substep_ignored("b_1").await.expect("progress");
    client.done(true).await.expect("done");

    let summary = handle.await.expect("join").expect("run");
    assert_eq!(
        summary,
        RunSummary {
            steps: 3,
            completed: 3,
            ignored: 2,
            succeeded: true,
        }
    );
}

#[tokio::test]
async fn failed_done_is_reflected_in_summary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    client.done(false).await.expect("done");
    let summary = handle.await.expect("join").expect("run");
    assert!(!summary.succeeded);
    assert_eq!(summary.steps, 0);
}

#[tokio::test]
async fn step_output_falls_back_to_last_workflow_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    client
        .step_completed(StepStatus::Complete, "w_1", json!({"out": 1}))
        .await
        .expect("step completed");
    client
        .step_completed(StepStatus::Partial, "w_2", json!({"out": 2}))
        .await
        .expect("step completed");
    sleep(SETTLE).await;

    assert_eq!(
        client.step_output("w_1").await.expect("exact"),
        json!({"out": 1})
    );
    // workflow-level lookup: lexicographically last step wins
    assert_eq!(
        client.step_output("w").await.expect("fallback"),
        json!({"out": 2})
    );
    assert_eq!(
        client.step_output("absent").await.expect("absent"),
        Value::Null
    );

    assert!(client.has_step("w_1").await.expect("exact"));
    assert!(client.has_step("w").await.expect("workflow prefix"));
    assert!(!client.has_step("w_9").await.expect("missing"));

    client.done(true).await.expect("done");
    handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn named_output_scans_labeled_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (endpoints, handle) = start_hub(test_config(dir.path()));
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    // same step reported three times; the index keeps the last handle
    client
        .step_completed(StepStatus::Complete, "step_a", json!({"labels": {}}))
        .await
        .expect("step completed");
    client
        .step_completed(StepStatus::Complete, "step_a", json!({"labels": {"other": 1}}))
        .await
        .expect("step completed");
    client
        .step_completed(
            StepStatus::Complete,
            "step_a",
            json!({"labels": {"label_x": 42}}),
        )
        .await
        .expect("step completed");
    sleep(SETTLE).await;

    assert_eq!(
        client.named_output("label_x").await.expect("labeled"),
        json!(42)
    );
    assert_eq!(
        client.named_output("absent").await.expect("unlabeled"),
        Value::Null
    );

    client.done(true).await.expect("done");
    handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn slave_hub_attaches_to_master() {
    let master_dir = tempfile::tempdir().expect("tempdir");
    let (master_endpoints, master_handle) = start_hub(test_config(master_dir.path()));

    let slave_dir = tempfile::tempdir().expect("tempdir");
    let slave_config = HubConfig {
        exec_mode: junction_common::config::ExecMode::Slave,
        master_endpoints: Some(master_dir.path().join("endpoints.json")),
        ..test_config(slave_dir.path())
    };
    let (slave_endpoints, slave_handle) = start_hub(slave_config);
    sleep(SETTLE).await;

    // the slave binds no tap channels of its own
    assert!(slave_endpoints.socket(Channel::TapLogging).is_err());
    assert!(master_endpoints.socket(Channel::TapLogging).is_ok());

    let mut slave_client = HubClient::connect(&slave_endpoints).await.expect("connect");
    slave_client.done(true).await.expect("slave done");
    slave_handle.await.expect("join").expect("run");

    let mut master_client = HubClient::connect(&master_endpoints).await.expect("connect");
    master_client.done(true).await.expect("master done");
    master_handle.await.expect("join").expect("run");
}

struct CapturingSink(std::sync::Arc<std::sync::Mutex<Vec<ListenerEvent>>>);

impl ListenerSink for CapturingSink {
    fn forward(&mut self, event: &ListenerEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn master_mode_taps_accept_relayed_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut hub = Hub::bind(test_config(dir.path())).expect("bind hub");
    hub.set_listener_sink(Box::new(CapturingSink(captured.clone())));
    let endpoints = hub.endpoints().clone();
    let handle = tokio::spawn(hub.run());
    let mut client = HubClient::connect(&endpoints).await.expect("connect");

    let mut logs = LogRelay::connect(&endpoints).await.expect("log relay");
    logs.send(LogLevel::Info, "relayed line")
        .await
        .expect("send log");

    let mut listener = ListenerRelay::connect(&endpoints).await.expect("listener relay");
    listener
        .send("task_status", json!({"task": "t1", "state": "running"}))
        .await
        .expect("send event");
    sleep(SETTLE).await;

    client.done(true).await.expect("done");
    handle.await.expect("join").expect("run");

    let events = captured.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg_type, "task_status");
}
