use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use table_field::config::AppConfig;
use table_field::{seed, MemoryStore};
use tokio::net::TcpListener;

// Test client wrapper for making API calls
struct TestClient {
    client: Client,
    base_url: String,
}

impl TestClient {
    fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn post(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(&format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }

    async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .get(&format!("{}{}", self.base_url, path))
            .send()
            .await
    }

    async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .delete(&format!("{}{}", self.base_url, path))
            .send()
            .await
    }

    async fn patch(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .patch(&format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }
}

/// Serves a seeded memory store on an ephemeral port.
async fn spawn_server() -> (TestClient, MemoryStore) {
    let store = MemoryStore::new();
    seed::load_demo_data(&store).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let served = store.clone();
    tokio::spawn(async move {
        let config = AppConfig::default();
        table_field::serve(listener, served, &config).await
    });

    (TestClient::new(format!("http://{}", address)), store)
}

async fn json_body(response: reqwest::Response) -> Value {
    response.json().await.unwrap()
}

fn names(rows: &Value) -> Vec<String> {
    rows.as_array()
        .unwrap()
        .iter()
        .map(|row| row["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_tags_workflow() {
    let (client, store) = spawn_server().await;

    let response = client
        .post("/fields/tags/sessions", json!({"parent": {"table": "posts", "id": 1}}))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = json_body(response).await;
    let session_id = session["session_id"].as_str().unwrap().to_string();
    assert_eq!(names(&session["rows"]), vec!["rust", "async"]);

    // Rename one tag, drop another, attach an existing one and add a new one
    let response = client
        .patch(
            &format!("/sessions/{}/rows/1", session_id),
            json!({"data": {"name": "rust-lang"}}),
        )
        .await
        .unwrap();
    assert_eq!(json_body(response).await["changed"], true);

    client
        .delete(&format!("/sessions/{}/rows/2", session_id))
        .await
        .unwrap();
    client
        .post(&format!("/sessions/{}/rows", session_id), json!({"data": {"id": 3}}))
        .await
        .unwrap();
    let created = json_body(
        client
            .post(&format!("/sessions/{}/rows", session_id), json!({"data": {"name": "tokio"}}))
            .await
            .unwrap(),
    )
    .await;
    assert!(created["key"].is_string());

    // Nothing is written before save
    assert_eq!(store.record("tags", 1).unwrap().fields["name"], "rust");
    assert_eq!(store.pivot_rows("post_tag").len(), 3);

    let plan = json_body(client.get(&format!("/sessions/{}/plan", session_id)).await.unwrap()).await;
    assert_eq!(plan["plan"]["kind"], "many_to_many");
    assert_eq!(plan["plan"]["detach"], json!([2]));

    let response = client
        .post(&format!("/sessions/{}/save", session_id), json!({}))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let saved = json_body(response).await;
    assert_eq!(saved["report"]["members"], json!([1, 3, 4]));
    assert_eq!(saved["report"]["created"], json!([4]));
    assert_eq!(names(&saved["rows"]), vec!["rust-lang", "web", "tokio"]);

    // Tag 2 is only detached, never deleted
    assert_eq!(store.record("tags", 2).unwrap().fields["name"], "async");

    // A fresh session sees the saved state
    let reopened = json_body(
        client
            .post("/fields/tags/sessions", json!({"parent": {"table": "posts", "id": 1}}))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(reopened["rows"], saved["rows"]);
    assert_eq!(reopened["dirty"], false);
}

#[tokio::test]
async fn test_comments_for_new_record_are_transient() {
    let (client, store) = spawn_server().await;

    // No parent yet: the field works but has nothing to save into
    let session = json_body(client.post("/fields/comments/sessions", json!({})).await.unwrap()).await;
    let session_id = session["session_id"].as_str().unwrap().to_string();
    assert_eq!(session["relationship"], Value::Null);
    assert_eq!(session["rows"], json!([]));

    let created = json_body(
        client
            .post(&format!("/sessions/{}/rows", session_id), json!({"data": {"body": "Draft"}}))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(created["rows"][0]["status"], "draft");

    let saved = json_body(
        client
            .post(&format!("/sessions/{}/save", session_id), json!({}))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(saved["report"], Value::Null);
    assert_eq!(store.records("comments").len(), 3);

    let response = client.delete(&format!("/sessions/{}", session_id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = client.get(&format!("/sessions/{}", session_id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
