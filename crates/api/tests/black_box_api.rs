use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use asyncjob_infra::jobs::{
    DispatchContext, DispatchError, DispatchOutcome, DispatcherRegistry, Job, PoolKind,
};
use asyncjob_server::app::{self, services::AppServices};
use asyncjob_server::config::ServerConfig;

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

fn registry() -> DispatcherRegistry {
    DispatcherRegistry::builder()
        .register(
            "echo",
            PoolKind::Api,
            |job: &Job, _ctx: &DispatchContext<'_>| -> Result<DispatchOutcome, DispatchError> {
                Ok(DispatchOutcome::succeeded(Some(json!({ "echo": job.cmd_payload }))))
            },
        )
        .register(
            "fail",
            PoolKind::Worker,
            |_job: &Job, _ctx: &DispatchContext<'_>| -> Result<DispatchOutcome, DispatchError> {
                Err("backend unreachable".into())
            },
        )
        .build()
        .unwrap()
}

impl TestServer {
    async fn spawn() -> Self {
        // Same wiring as prod (in-memory store), bound to an ephemeral port.
        let mut config = ServerConfig::default();
        config.job = config
            .job
            .with_intervals(Duration::from_millis(20), Duration::from_millis(200));

        let services = Arc::new(
            app::services::build_services(&config, registry())
                .await
                .expect("failed to wire services"),
        );
        let router = app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }

    async fn submit(&self, client: &reqwest::Client, body: serde_json::Value) -> i64 {
        let res = client
            .post(format!("{}/jobs", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = res.json().await.unwrap();
        body["job_id"].as_i64().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.services.shutdown();
    }
}

async fn finished_job(client: &reqwest::Client, base_url: &str, id: i64) -> serde_json::Value {
    // Dispatch is asynchronous; poll until the job leaves IN_PROGRESS.
    for _ in 0..300 {
        let res = client
            .get(format!("{}/jobs/{}", base_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let job: serde_json::Value = res.json().await.unwrap();
        if job["status"] != "IN_PROGRESS" {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not finish within timeout");
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_node_and_gate() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], 1);
    assert_eq!(body["accepting"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn submitted_job_runs_to_completion() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let id = srv
        .submit(
            &client,
            json!({ "dispatcher": "echo", "cmd": "ping", "payload": { "n": 1 }, "related": 5 }),
        )
        .await;

    let job = finished_job(&client, &srv.base_url, id).await;
    assert_eq!(job["status"], "SUCCEEDED");
    assert_eq!(job["result"], json!({ "echo": { "n": 1 } }));
    assert_eq!(job["complete_node_id"], 1);
    assert_eq!(job["related"], 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatcher_error_fails_the_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let id = srv
        .submit(&client, json!({ "dispatcher": "fail", "cmd": "sync" }))
        .await;

    let job = finished_job(&client, &srv.base_url, id).await;
    assert_eq!(job["status"], "FAILED");
    assert_eq!(job["result_code"], 530);
    assert_eq!(job["result"]["error"], "backend unreachable");
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_on_one_resource_all_complete() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            srv.submit(
                &client,
                json!({
                    "dispatcher": "echo",
                    "cmd": "resize",
                    "payload": { "i": i },
                    "instance_type": "VirtualMachine",
                    "instance_id": 9,
                    "resource": { "resource_type": "VirtualMachine", "resource_id": 9 }
                }),
            )
            .await,
        );
    }

    for (i, id) in ids.into_iter().enumerate() {
        let job = finished_job(&client, &srv.base_url, id).await;
        assert_eq!(job["status"], "SUCCEEDED");
        assert_eq!(job["result"]["echo"]["i"], i);
        assert_eq!(job["instance_type"], "VirtualMachine");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_dispatcher_and_missing_job_are_client_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "dispatcher": "nope", "cmd": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_dispatcher");

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, 987_654))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test(flavor = "multi_thread")]
async fn submission_gate_rejects_new_jobs() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/admin/accepting", srv.base_url))
        .json(&json!({ "accepting": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "dispatcher": "echo", "cmd": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_accepting");

    client
        .post(format!("{}/admin/accepting", srv.base_url))
        .json(&json!({ "accepting": true }))
        .send()
        .await
        .unwrap();
    let id = srv
        .submit(&client, json!({ "dispatcher": "echo", "cmd": "x" }))
        .await;
    assert_eq!(finished_job(&client, &srv.base_url, id).await["status"], "SUCCEEDED");
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_events_and_introspection() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/cluster/events", srv.base_url))
        .json(&json!({ "event": "node_left", "node_ids": [77] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let res = client
        .post(format!("{}/cluster/events", srv.base_url))
        .json(&json!({ "event": "node_exploded" }))
        .send()
        .await
        .unwrap();
    assert!(res.status().is_client_error());

    let res = client
        .get(format!("{}/jobs/active", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let active: serde_json::Value = res.json().await.unwrap();
    assert!(active.is_array());

    let res = client
        .get(format!("{}/admin/scheduler", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let stats: serde_json::Value = res.json().await.unwrap();
    assert!(stats["heartbeat_ticks"].is_u64());
}
