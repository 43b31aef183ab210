//! HTTP surface tests against a live router on an ephemeral port.

mod common;

use grepwise::core::PartitionGranularity;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn intake_search_and_reveal_flow() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = common::serve_http(&app).await;
    let client = reqwest::Client::new();

    // Ingest over HTTP.
    let response = client
        .post(format!("{}/logs", base))
        .json(&json!({
            "message": "user=admin password=hunter2",
            "level": "INFO",
            "source": "auth-service",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    app.buffer.flush().await.unwrap();

    // Search returns the masked message.
    let response = client
        .get(format!("{}/logs/search?q=password", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(
        body["results"][0]["message"],
        "user=admin password=*****"
    );

    // Reveal without authorization is forbidden.
    let response = client
        .get(format!("{}/logs/{}?reveal=true", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Reveal with the auth layer's flag returns the original bytes.
    let response = client
        .get(format!("{}/logs/{}?reveal=true", base, id))
        .header("X-Authorized-Reveal", "true")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "user=admin password=hunter2");

    // Without reveal the single-entry endpoint is masked too.
    let response = client
        .get(format!("{}/logs/{}", base, id))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "user=admin password=*****");
}

#[tokio::test]
async fn spl_endpoint_returns_stats_mapping() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = common::serve_http(&app).await;
    let client = reqwest::Client::new();

    for (level, n) in [("ERROR", 3), ("WARN", 2), ("INFO", 5)] {
        for i in 0..n {
            client
                .post(format!("{}/logs", base))
                .json(&json!({ "message": format!("event {}", i), "level": level }))
                .send()
                .await
                .unwrap();
        }
    }
    app.buffer.flush().await.unwrap();

    let response = client
        .post(format!("{}/logs/spl", base))
        .body("search * | stats count by level")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, json!({"ERROR": 3, "WARN": 2, "INFO": 5}));
}

#[tokio::test]
async fn spl_endpoint_rejects_bad_queries() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = common::serve_http(&app).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/logs/spl", base))
        .body("where level = ERROR")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(format!("{}/logs/spl", base))
        .body("search * | eval x = 1 + 2")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "query");
}

#[tokio::test]
async fn count_endpoint() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = common::serve_http(&app).await;
    let client = reqwest::Client::new();

    for i in 0..4 {
        client
            .post(format!("{}/logs", base))
            .json(&json!({ "message": format!("countable {}", i) }))
            .send()
            .await
            .unwrap();
    }
    app.buffer.flush().await.unwrap();

    let count: usize = client
        .get(format!("{}/logs/count?q=countable", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(count, 4);
}

#[tokio::test]
async fn alarm_crud_and_on_demand_evaluation() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = common::serve_http(&app).await;
    let client = reqwest::Client::new();

    // Two matching entries.
    for i in 0..2 {
        client
            .post(format!("{}/logs", base))
            .json(&json!({ "message": format!("fatal crash {}", i), "level": "ERROR" }))
            .send()
            .await
            .unwrap();
    }
    app.buffer.flush().await.unwrap();

    let alarm = json!({
        "id": "crashes",
        "name": "crash alarm",
        "query": "search crash",
        "window_ms": 300000,
        "threshold_op": ">",
        "threshold_value": 1.0,
        "interval_ms": 60000,
        "throttle_ms": 600000,
        "channels": [],
        "enabled": true,
    });
    let response = client
        .post(format!("{}/alarms", base))
        .json(&alarm)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let listed: serde_json::Value = client
        .get(format!("{}/alarms", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let report: serde_json::Value = client
        .post(format!("{}/alarms/crashes/evaluate", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["state"], "FIRING");

    let response = client
        .delete(format!("{}/alarms/crashes", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    let response = client
        .get(format!("{}/alarms/crashes", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn redaction_config_endpoints() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = common::serve_http(&app).await;
    let client = reqwest::Client::new();

    // Defaults are always visible in the flattened view.
    let view: serde_json::Value = client
        .get(format!("{}/redaction/config", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let keys: Vec<String> = view["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k.as_str().unwrap().to_string())
        .collect();
    assert!(keys.contains(&"password".to_string()));
    assert!(keys.contains(&"passwd".to_string()));

    // Flat payloads are rejected on write.
    let response = client
        .post(format!("{}/redaction/config", base))
        .json(&json!({"keys": ["a"], "patterns": ["b"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Grouped payloads are accepted.
    let response = client
        .post(format!("{}/redaction/config", base))
        .json(&json!({"token": {"patterns": ["(token)=(\\S+)"]}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let response = client
        .post(format!("{}/redaction/reload", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn source_management_endpoints() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = common::serve_http(&app).await;
    let client = reqwest::Client::new();

    // Pick a free port for the listener.
    let port = {
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        probe.local_addr().unwrap().port()
    };

    let response = client
        .post(format!("{}/sources", base))
        .json(&json!({
            "id": "syslog-1",
            "name": "test syslog",
            "enabled": true,
            "sourceType": "SYSLOG",
            "syslogPort": port,
            "syslogProtocol": "TCP",
            "syslogFormat": "RFC5424",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let sources: serde_json::Value = client
        .get(format!("{}/sources", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sources.as_array().unwrap().len(), 1);
    assert_eq!(sources[0]["syslogProtocol"], "TCP");

    let response = client
        .delete(format!("{}/sources/syslog-1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn health_endpoint() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = common::serve_http(&app).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/logs", base))
        .json(&json!({ "message": "healthy" }))
        .send()
        .await
        .unwrap();
    app.buffer.flush().await.unwrap();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["active_partitions"], 1);
}
