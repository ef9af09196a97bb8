use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use lesson_hub::api::{self, AppState};
use lesson_hub::config::{Settings, DEFAULT_START_PAGE};
use lesson_hub_core::index::DocumentIndex;
use lesson_hub_core::permission::Evaluator;
use lesson_hub_core::pipeline::{Pipeline, PERMISSION_DENIED_MESSAGE};
use lesson_hub_core::preferences::{MemoryAttributeStore, Preferences, LAST_VISITED_ATTRIBUTE};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

struct Hub {
    _dir: TempDir,
    store: Arc<MemoryAttributeStore>,
    app: Router,
}

fn hub() -> Hub {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("unit/img")).unwrap();
    std::fs::create_dir_all(root.join("staff")).unwrap();
    std::fs::write(root.join("index.md"), "# Welcome\n").unwrap();
    std::fs::write(root.join("unit/lesson.md"), "# Lesson\n\n![[cat.png]]\n").unwrap();
    std::fs::write(root.join("unit/img/cat.png"), "png").unwrap();
    std::fs::write(root.join("staff/plan.md"), "@@@teacher\n# Plan\n").unwrap();
    std::fs::write(root.join("notes.txt"), "not indexed as markdown").unwrap();

    let index = Arc::new(DocumentIndex::new());
    index.scan("md/", root, true, &[]);
    let store = Arc::new(MemoryAttributeStore::new());
    let pipeline = Pipeline::new(Evaluator::new(store.clone(), "lessons"), index);
    let app = api::router(AppState::new(pipeline, None, Settings::for_root(root)));
    Hub {
        _dir: dir,
        store,
        app,
    }
}

fn token(name: &str, ldap: &str) -> String {
    let claims = json!({ "sub": format!("id-{name}"), "name": name, "ldap": ldap });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap()
}

fn student() -> String {
    token("Arnold", "CN=Arnold,OU=Students,DC=school")
}

fn teacher() -> String {
    token("Ms Frizzle", "CN=Frizzle,OU=Teachers,DC=school")
}

fn get(uri: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .header(header::HOST, "hub.example")
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, bearer: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn wait_for(store: &MemoryAttributeStore, user: &str, key: &str) -> Option<String> {
    for _ in 0..50 {
        if let Some(value) = store.get(user, key) {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[tokio::test]
async fn health_is_open_and_carries_security_headers() {
    let hub = hub();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, headers, body) = send(&hub.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert_eq!(headers[header::X_FRAME_OPTIONS], "SAMEORIGIN");
    assert_eq!(headers[header::CONTENT_SECURITY_POLICY], "frame-ancestors 'self'");
}

#[tokio::test]
async fn requests_without_a_bearer_are_rejected() {
    let hub = hub();
    for uri in ["/", "/md/index.md", "/api/listing", "/userattributes"] {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, _, _) = send(&hub.app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
    }
    let (status, _, _) = send(&hub.app, get("/api/listing", "not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn renders_documents_and_records_the_visit() {
    let hub = hub();
    let (status, _, body) = send(&hub.app, get("/md/unit/lesson.md", &student())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(">Lesson</h1>"));
    assert!(body.contains(r#"src="http://hub.example/md/unit/img/cat.png""#));

    let visited = wait_for(&hub.store, "arnold", LAST_VISITED_ATTRIBUTE).await;
    assert_eq!(visited.as_deref(), Some("/md/unit/lesson.md"));
}

#[tokio::test]
async fn gated_document_shows_the_error_panel() {
    let hub = hub();
    hub.store.insert("arnold", "config", "{}");
    let (status, _, body) = send(&hub.app, get("/md/staff/plan.md", &student())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(PERMISSION_DENIED_MESSAGE));
    assert!(!body.contains("Plan"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.store.get("arnold", LAST_VISITED_ATTRIBUTE), None);

    hub.store.insert("ms frizzle", "config", r#"{"vt":1}"#);
    let (_, _, body) = send(&hub.app, get("/md/staff/plan.md", &teacher())).await;
    assert!(body.contains(">Plan</h1>"));
}

#[tokio::test]
async fn serves_indexed_files_only() {
    let hub = hub();
    let (status, _, body) = send(&hub.app, get("/md/unit/img/cat.png", &student())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "png");

    let (status, _, _) = send(&hub.app, get("/md/unit/img/dog.png", &student())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = send(&hub.app, get("/md/missing.md", &student())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn root_redirects_to_last_page_when_asked() {
    let hub = hub();
    let (status, headers, _) = send(&hub.app, get("/", &student())).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[header::LOCATION], DEFAULT_START_PAGE);

    hub.store.insert("arnold", "config", r#"{"sl":1}"#);
    hub.store.insert("arnold", LAST_VISITED_ATTRIBUTE, "/md/unit/lesson.md");
    let (_, headers, _) = send(&hub.app, get("/", &student())).await;
    assert_eq!(headers[header::LOCATION], "/md/unit/lesson.md");

    hub.store.insert("arnold", "config", r#"{"sl":"0"}"#);
    let (_, headers, _) = send(&hub.app, get("/", &student())).await;
    assert_eq!(headers[header::LOCATION], DEFAULT_START_PAGE);
}

#[tokio::test]
async fn listing_hides_gated_documents() {
    let hub = hub();
    hub.store.insert("arnold", "config", "{}");
    hub.store.insert("ms frizzle", "config", r#"{"vt":1}"#);

    let paths = |body: &str| -> Vec<String> {
        let entries: Vec<Value> = serde_json::from_str(body).unwrap();
        entries.iter().map(|e| e["path"].as_str().unwrap().to_string()).collect()
    };
    let (_, _, body) = send(&hub.app, get("/api/listing", &student())).await;
    assert_eq!(paths(&body), vec!["unit/lesson.md", "index.md"]);

    let (_, _, body) = send(&hub.app, get("/api/listing", &teacher())).await;
    assert_eq!(paths(&body), vec!["staff/plan.md", "unit/lesson.md", "index.md"]);
}

#[tokio::test]
async fn affordances_follow_roles() {
    let hub = hub();
    hub.store.insert("ms frizzle", "config", r#"{"vt":0}"#);
    let (_, _, body) = send(&hub.app, get("/api/affordances", &teacher())).await;
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value, json!({"teacher_toggle": true, "exam_toggle": false}));

    let (_, _, body) = send(&hub.app, get("/api/affordances", &student())).await;
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value, json!({"teacher_toggle": false, "exam_toggle": false}));
}

#[tokio::test]
async fn converts_posted_markdown() {
    let hub = hub();
    let req = post_json("/convert", &student(), json!({"content": "# Hi\n\n## There\n"}));
    let (status, _, body) = send(&hub.app, req).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert!(value["html"].as_str().unwrap().contains(">Hi</h1>"));
    let ids: Vec<&str> = value["content_map"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["ROOT", "hi", "there"]);

    let (status, _, _) = send(&hub.app, post_json("/convert", &student(), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = send(&hub.app, get("/convert", &student())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stores_and_reports_user_attributes() {
    let hub = hub();
    let req = post_json("/userattributes", &student(), json!({"dm": 1, "sl": "1"}));
    let (status, _, body) = send(&hub.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"success": true}));

    let stored = hub.store.get("arnold", "config").unwrap();
    let prefs = Preferences::from_json(&stored).unwrap();
    assert_eq!(prefs.dm, Some(1.0));
    assert_eq!(prefs.sl, Some(1.0));

    let (_, _, body) = send(&hub.app, get("/userattributes", &student())).await;
    let profile: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(profile["name"], "Arnold");
    assert_eq!(profile["roles"], json!(["arnold", "student"]));
    assert_eq!(profile["attributes"]["config"], stored.as_str());

    hub.store.set_failing(true);
    let req = post_json("/userattributes", &student(), json!({"dm": 0}));
    let (_, _, body) = send(&hub.app, req).await;
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"success": false}));
}
