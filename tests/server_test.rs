//! HTTP surface tests: discovery record, health, config patch, channel
//! capabilities, webhook secret verification, and the 409 on an
//! active-mode trigger with no command pipeline.

use std::sync::Arc;
use std::time::Duration;

use mu::backend::UnconfiguredRunExecutor;
use mu::config::RuntimePaths;

struct Server {
    /// Keeps the workspace alive for the test.
    _dir: tempfile::TempDir,
    base: String,
    client: reqwest::Client,
}

async fn start_server(config_toml: &str) -> Server {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = RuntimePaths::resolve(dir.path());
    std::fs::create_dir_all(&paths.mu_dir).expect("mkdir");
    std::fs::write(&paths.config_toml, config_toml).expect("write config");

    let context = mu::server::build_context(dir.path(), Arc::new(UnconfiguredRunExecutor), None)
        .expect("build context");
    tokio::spawn(async move {
        let _ = mu::server::serve(context, 0).await;
    });

    // Wait for the discovery record.
    let mut url = None;
    for _ in 0..200 {
        if let Ok(raw) = std::fs::read_to_string(&paths.server_json) {
            if let Ok(discovery) = serde_json::from_str::<serde_json::Value>(&raw) {
                url = discovery.get("url").and_then(|u| u.as_str()).map(str::to_owned);
                if url.is_some() {
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Server {
        _dir: dir,
        base: url.expect("server.json must carry the url"),
        client: reqwest::Client::new(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn healthz_and_status() {
    let server = start_server("").await;

    let health = server
        .client
        .get(format!("{}/healthz", server.base))
        .send()
        .await
        .expect("healthz");
    assert!(health.status().is_success());
    assert_eq!(health.text().await.expect("body"), "ok");

    let status: serde_json::Value = server
        .client
        .get(format!("{}/api/status", server.base))
        .send()
        .await
        .expect("status")
        .json()
        .await
        .expect("json");
    assert_eq!(status["control_plane"]["active"], true);
    assert!(status["control_plane"]["observability"]["counters"]["events_emitted"].is_number());
}

#[tokio::test(flavor = "multi_thread")]
async fn config_patch_round_trips() {
    let server = start_server("").await;

    let before: serde_json::Value = server
        .client
        .get(format!("{}/api/config", server.base))
        .send()
        .await
        .expect("get config")
        .json()
        .await
        .expect("json");
    assert_eq!(before["operator"]["wake_turn_mode"], "passive");

    let patched: serde_json::Value = server
        .client
        .post(format!("{}/api/config", server.base))
        .json(&serde_json::json!({ "operator": { "wake_turn_mode": "active" } }))
        .send()
        .await
        .expect("patch")
        .json()
        .await
        .expect("json");
    assert_eq!(patched["operator"]["wake_turn_mode"], "active");

    let after: serde_json::Value = server
        .client
        .get(format!("{}/api/config", server.base))
        .send()
        .await
        .expect("get config")
        .json()
        .await
        .expect("json");
    assert_eq!(after["operator"]["wake_turn_mode"], "active");

    let bad = server
        .client
        .post(format!("{}/api/config", server.base))
        .json(&serde_json::json!({ "operator": { "wake_turn_mode": "sideways" } }))
        .send()
        .await
        .expect("patch");
    assert_eq!(bad.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn active_trigger_without_pipeline_is_409() {
    let server = start_server(
        "[operator]\nwake_turn_mode = \"active\"\n",
    )
    .await;

    let program: serde_json::Value = server
        .client
        .post(format!("{}/api/heartbeats", server.base))
        .json(&serde_json::json!({ "title": "Wake heartbeat", "every_ms": 0 }))
        .send()
        .await
        .expect("create")
        .json()
        .await
        .expect("json");
    let program_id = program["program_id"].as_str().expect("id");

    let response = server
        .client
        .post(format!("{}/api/heartbeats/{program_id}/trigger", server.base))
        .json(&serde_json::json!({ "reason": "manual" }))
        .send()
        .await
        .expect("trigger");
    assert_eq!(response.status().as_u16(), 409);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["reason_code"], "precondition_failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_program_is_404() {
    let server = start_server("").await;
    let response = server
        .client
        .get(format!("{}/api/heartbeats/hb-000000000000", server.base))
        .send()
        .await
        .expect("get");
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_requires_known_channel_and_secret() {
    let server = start_server(
        "[channels.slack]\nsecret = \"s3cret\"\n",
    )
    .await;

    let envelope = serde_json::json!({
        "channel_tenant_id": "T1",
        "channel_conversation_id": "C1",
        "channel_actor_id": "U1",
        "text": "status please",
    });

    // Unknown channel.
    let response = server
        .client
        .post(format!("{}/webhooks/carrier-pigeon", server.base))
        .json(&envelope)
        .send()
        .await
        .expect("post");
    assert_eq!(response.status().as_u16(), 404);

    // Known but unconfigured channel.
    let response = server
        .client
        .post(format!("{}/webhooks/discord", server.base))
        .json(&envelope)
        .send()
        .await
        .expect("post");
    assert_eq!(response.status().as_u16(), 409);

    // Wrong secret.
    let response = server
        .client
        .post(format!("{}/webhooks/slack", server.base))
        .header("x-mu-adapter-secret", "wrong")
        .json(&envelope)
        .send()
        .await
        .expect("post");
    assert_eq!(response.status().as_u16(), 400);

    // Right secret, but no command backend: the pipeline is unavailable.
    let response = server
        .client
        .post(format!("{}/webhooks/slack", server.base))
        .header("x-mu-adapter-secret", "s3cret")
        .json(&envelope)
        .send()
        .await
        .expect("post");
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_capabilities_reflect_config() {
    let server = start_server(
        "[channels.slack]\nsecret = \"s3cret\"\n",
    )
    .await;

    let body: serde_json::Value = server
        .client
        .get(format!("{}/api/control-plane/channels", server.base))
        .send()
        .await
        .expect("channels")
        .json()
        .await
        .expect("json");
    let channels = body["channels"].as_array().expect("array");
    assert_eq!(channels.len(), 5);
    let slack = channels
        .iter()
        .find(|c| c["channel"] == "slack")
        .expect("slack row");
    assert_eq!(slack["configured"], true);
    assert_eq!(slack["verification"]["kind"], "shared_secret");
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_and_rollback_swap_generations() {
    let server = start_server("").await;

    let reloaded: serde_json::Value = server
        .client
        .post(format!("{}/api/control-plane/reload", server.base))
        .send()
        .await
        .expect("reload")
        .json()
        .await
        .expect("json");
    assert_eq!(reloaded["active"]["id"], 2);
    assert_eq!(reloaded["last_outcome"]["outcome"], "reloaded");

    let rolled: serde_json::Value = server
        .client
        .post(format!("{}/api/control-plane/rollback", server.base))
        .send()
        .await
        .expect("rollback")
        .json()
        .await
        .expect("json");
    assert_eq!(rolled["active"]["id"], 1);
    assert_eq!(rolled["last_outcome"]["outcome"], "rolled_back");
}
