/// Integration tests for the single-node HTTP API.
///
/// These spin a real server on a random port and exercise the client
/// surface end to end: round trips, error mapping, the search routes and
/// restart durability.
use quartz_kv::{http, ApiServer, IndexedStore, KvStore, SingleNode};
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    node: Arc<SingleNode>,
    handle: JoinHandle<()>,
}

impl TestServer {
    fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    /// Graceful stop: checkpoint the store, then kill the server task.
    fn stop_with_checkpoint(self) {
        self.node.indexed().store().checkpoint().unwrap();
        self.handle.abort();
    }
}

async fn spawn_single(data_dir: &Path) -> TestServer {
    let store = KvStore::open(data_dir, false).unwrap();
    let node = Arc::new(SingleNode::new(IndexedStore::new(store)));
    let server = ApiServer::bind("127.0.0.1:0", http::single_router(node.clone()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.serve().await;
    });
    TestServer { addr, node, handle }
}

async fn set(client: &reqwest::Client, server: &TestServer, key: &str, value: &str) {
    let response = client
        .post(server.url("/set"))
        .json(&json!({ "key": key, "value": value }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["success"], json!(true));
}

async fn get(client: &reqwest::Client, server: &TestServer, key: &str) -> Option<String> {
    let response = client
        .get(server.url(&format!("/get?key={key}")))
        .send()
        .await
        .unwrap();
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return None;
    }
    let body: JsonValue = response.json().await.unwrap();
    Some(body["value"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn test_set_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_single(dir.path()).await;
    let client = reqwest::Client::new();

    set(&client, &server, "test_key", "test_value").await;
    assert_eq!(
        get(&client, &server, "test_key").await,
        Some("test_value".to_string())
    );
}

#[tokio::test]
async fn test_get_without_setting() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_single(dir.path()).await;
    let client = reqwest::Client::new();

    assert_eq!(get(&client, &server, "non_existent_key").await, None);
}

#[tokio::test]
async fn test_set_then_delete_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_single(dir.path()).await;
    let client = reqwest::Client::new();

    set(&client, &server, "test_key", "test_value").await;

    let response = client
        .post(server.url("/delete"))
        .json(&json!({ "key": "test_key" }))
        .send()
        .await
        .unwrap();
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["success"], json!(true));

    assert_eq!(get(&client, &server, "test_key").await, None);

    // Deleting again reports false.
    let response = client
        .post(server.url("/delete"))
        .json(&json!({ "key": "test_key" }))
        .send()
        .await
        .unwrap();
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn test_overwrite_returns_latest() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_single(dir.path()).await;
    let client = reqwest::Client::new();

    set(&client, &server, "k", "v1").await;
    set(&client, &server, "k", "v2").await;
    assert_eq!(get(&client, &server, "k").await, Some("v2".to_string()));
}

#[tokio::test]
async fn test_bulk_set_counts_and_applies() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_single(dir.path()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/bulk_set"))
        .json(&json!({
            "items": [
                {"key": "k1", "value": "v1"},
                {"key": "k2", "value": "v2"},
                {"key": "k3", "value": "v3"},
            ]
        }))
        .send()
        .await
        .unwrap();
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["count"], json!(3));

    assert_eq!(get(&client, &server, "k2").await, Some("v2".to_string()));
}

#[tokio::test]
async fn test_concurrent_bulk_sets_on_overlapping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_single(dir.path()).await;
    let client = reqwest::Client::new();

    let first = client
        .post(server.url("/bulk_set"))
        .json(&json!({
            "items": [
                {"key": "k1", "value": "v1"},
                {"key": "k2", "value": "v1"},
                {"key": "k3", "value": "v1"},
            ]
        }))
        .send();
    let second = client
        .post(server.url("/bulk_set"))
        .json(&json!({
            "items": [
                {"key": "k1", "value": "v2"},
                {"key": "k2", "value": "v2"},
                {"key": "k4", "value": "v2"},
            ]
        }))
        .send();

    let (first, second) = tokio::join!(first, second);
    let first: JsonValue = first.unwrap().json().await.unwrap();
    let second: JsonValue = second.unwrap().json().await.unwrap();
    assert_eq!(first["count"], json!(3));
    assert_eq!(second["count"], json!(3));

    // Overlapping keys land on either value; disjoint keys are fixed.
    for key in ["k1", "k2"] {
        let value = get(&client, &server, key).await.unwrap();
        assert!(value == "v1" || value == "v2", "{key} held {value}");
    }
    assert_eq!(get(&client, &server, "k3").await, Some("v1".to_string()));
    assert_eq!(get(&client, &server, "k4").await, Some("v2".to_string()));
}

#[tokio::test]
async fn test_bad_requests_and_unknown_paths() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_single(dir.path()).await;
    let client = reqwest::Client::new();

    // Missing key parameter.
    let response = client.get(server.url("/get")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Empty key.
    let response = client
        .post(server.url("/set"))
        .json(&json!({ "key": "", "value": "v" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Empty bulk.
    let response = client
        .post(server.url("/bulk_set"))
        .json(&json!({ "items": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Unknown path.
    let response = client.get(server.url("/nope")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_search_routes() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_single(dir.path()).await;
    let client = reqwest::Client::new();

    set(&client, &server, "doc1", "rust systems programming").await;
    set(&client, &server, "doc2", "rust web services").await;

    let response = client
        .get(server.url("/search/text?q=rust%20systems"))
        .send()
        .await
        .unwrap();
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["keys"], json!(["doc1"]));

    let response = client
        .get(server.url("/search/similar?q=rust%20programming&top_k=1"))
        .send()
        .await
        .unwrap();
    let body: JsonValue = response.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0][0], json!("doc1"));
}

#[tokio::test]
async fn test_graceful_restart_durability() {
    let dir = tempfile::tempdir().unwrap();
    let client = reqwest::Client::new();

    {
        let server = spawn_single(dir.path()).await;
        set(&client, &server, "k", "persistent_value").await;
        server.stop_with_checkpoint();
    }

    let server = spawn_single(dir.path()).await;
    assert_eq!(
        get(&client, &server, "k").await,
        Some("persistent_value".to_string())
    );
}

#[tokio::test]
async fn test_hard_restart_replays_wal() {
    let dir = tempfile::tempdir().unwrap();
    let client = reqwest::Client::new();

    {
        let server = spawn_single(dir.path()).await;
        for i in 0..20 {
            set(&client, &server, &format!("k_{i}"), &format!("v_{i}")).await;
        }
        // Hard kill: no checkpoint, the WAL alone must carry the state.
        server.handle.abort();
    }
    std::fs::remove_file(dir.path().join("data.json")).unwrap();

    let server = spawn_single(dir.path()).await;
    for i in 0..20 {
        assert_eq!(
            get(&client, &server, &format!("k_{i}")).await,
            Some(format!("v_{i}")),
            "acknowledged key k_{i} lost after hard restart"
        );
    }
}
