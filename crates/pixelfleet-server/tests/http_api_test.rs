//! HTTP surface tests: an in-process server over an engine whose worker
//! address is unreachable, so jobs never leave `pending` unless evicted.

use pixelfleet_common::FleetConfig;
use pixelfleet_engine::Engine;
use pixelfleet_server::build_router;
use reqwest::multipart;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;

async fn serve_engine(config: FleetConfig) -> (String, Arc<Engine>) {
    let engine = Engine::new(config).unwrap();
    let app = build_router(engine.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), engine)
}

fn dead_worker_config() -> FleetConfig {
    FleetConfig {
        worker_hosts: vec!["127.0.0.1:1".to_string()],
        ..Default::default()
    }
}

fn upload_form() -> multipart::Form {
    multipart::Form::new().part(
        "imageFile",
        multipart::Part::bytes(b"fake image bytes".to_vec()).file_name("input.png"),
    )
}

async fn submit_async_job(base: &str, client: &reqwest::Client) -> String {
    let response = client
        .post(format!("{base}/api/remove-background?async=true"))
        .multipart(upload_form())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    body["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_async_upload_creates_pending_job() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    let id = submit_async_job(&base, &client).await;

    let response = client
        .get(format!("{base}/api/jobs/{id}/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "pending");
    assert_eq!(body["kind"], "remove-background");
    assert!(body["created_time"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_upload_without_image_is_rejected() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/upscale-image?async=true"))
        .multipart(multipart::Form::new().text("format", "PNG"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("imageFile"));
}

#[tokio::test]
async fn test_upload_with_bad_format_is_rejected() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/upscale-image?async=true&format=BMP"))
        .multipart(upload_form())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_async_route_rejects_unknown_kind() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/async/sharpen"))
        .multipart(upload_form())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_async_route_accepts_kind_aliases() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    for kind in ["remove-bg", "upscale-image", "upscale-remove-bg"] {
        let response = client
            .post(format!("{base}/api/async/{kind}"))
            .multipart(upload_form())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202, "kind {kind}");
    }
}

#[tokio::test]
async fn test_status_of_unknown_job_is_404() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{base}/api/jobs/00000000-0000-4000-8000-000000000000/status"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .get(format!("{base}/api/jobs/not-a-uuid/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_result_of_pending_job_is_conflict() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();
    let id = submit_async_job(&base, &client).await;

    let response = client
        .get(format!("{base}/api/jobs/{id}/result"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "pending");
}

#[tokio::test]
async fn test_list_with_filters() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();
    submit_async_job(&base, &client).await;
    submit_async_job(&base, &client).await;

    let body: Value = client
        .get(format!("{base}/api/jobs/list?state=pending"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 2);

    let body: Value = client
        .get(format!("{base}/api/jobs/list?kind=upscale"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 0);

    let response = client
        .get(format!("{base}/api/jobs/list?state=bogus"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();
    let id = submit_async_job(&base, &client).await;

    let body: Value = client
        .delete(format!("{base}/api/jobs/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["deleted"], true);

    let body: Value = client
        .delete(format!("{base}/api/jobs/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["deleted"], false);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let body: Value = client
            .post(format!("{base}/api/jobs/cleanup"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // No terminal jobs exist; nothing to remove either time.
        assert_eq!(body["removed"], 0);
    }
}

#[tokio::test]
async fn test_stats_counts_by_state() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();
    submit_async_job(&base, &client).await;

    let body: Value = client
        .get(format!("{base}/api/jobs/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["by_state"]["pending"], 1);
    assert_eq!(body["in_flight"], 0);
}

#[tokio::test]
async fn test_health_is_503_without_running_scheduler() {
    // The engine was never started, so the scheduler is not running.
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["scheduler_running"], false);
    assert!(body["workers"].as_array().unwrap().len() == 1);
}

#[tokio::test]
async fn test_metrics_endpoints_serve_snapshot() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();
    submit_async_job(&base, &client).await;

    for route in ["/status/metrics", "/api/metrics"] {
        let body: Value = client
            .get(format!("{base}{route}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["jobs_created"], 1, "route {route}");
    }
}

#[tokio::test]
async fn test_breaker_admin_round_trip() {
    let (base, _engine) = serve_engine(dead_worker_config()).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/api/circuit-breakers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["breakers"][0]["state"], "closed");

    let response = client
        .post(format!("{base}/api/circuit-breakers/127.0.0.1:1/open"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = client
        .get(format!("{base}/api/circuit-breakers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["breakers"][0]["state"], "open");

    let response = client
        .post(format!("{base}/api/circuit-breakers/127.0.0.1:1/close"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{base}/api/circuit-breakers/nope/open"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_sync_request_reports_stuck_job() {
    // Dead worker and a one-second job deadline: the sync path returns once
    // the deadline evicts the job as stuck.
    let config = FleetConfig {
        worker_hosts: vec!["127.0.0.1:1".to_string()],
        job_timeout_secs: 1,
        ..Default::default()
    };
    let (base, _engine) = serve_engine(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/remove-background"))
        .multipart(upload_form())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "failed");
    assert_eq!(body["error_details"]["kind"], "stuck");
}
