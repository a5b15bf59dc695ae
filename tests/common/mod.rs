#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use citeline::api::ChatApi;
use citeline::auth::AuthClient;
use citeline::*;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

pub const CONVERSATION_ID: &str = "conv-1";
pub const FRESH_TOKEN: &str = "fresh-token";
pub const DOCUMENT: &[u8] = b"%PDF-1.7 cited contract";

/// A request that reached one of the plain history routes.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub body: Value,
    pub token: String,
}

/// Scripted chat backend.
#[derive(Default)]
pub struct Backend {
    /// Raw body chunks of the next generate response.
    pub chunks: Vec<String>,
    /// Keep the generate response open after the last chunk.
    pub hang: bool,
    pub generate_status: Option<(StatusCode, Value)>,
    /// Tokens answered with `401 {"payload": "Token Expired"}`.
    pub expired_tokens: Vec<String>,
    pub fail_updates: bool,

    pub generate_requests: Vec<Value>,
    pub generate_tokens: Vec<String>,
    pub update_calls: usize,
    pub refresh_calls: usize,
    pub stored: HashMap<String, Vec<Value>>,
    /// Canned answers by path for every other route; default `200 {"success": true}`.
    pub responses: HashMap<String, (StatusCode, Value)>,
    pub calls: Vec<RecordedCall>,
}

pub type Shared = Arc<Mutex<Backend>>;

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

async fn generate(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let token = bearer(&headers);
    let mut backend = state.lock().unwrap();
    backend.generate_tokens.push(token.clone());
    if backend.expired_tokens.contains(&token) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "payload": "Token Expired" }))).into_response();
    }
    backend.generate_requests.push(body);
    if let Some((status, body)) = backend.generate_status.clone() {
        return (status, Json(body)).into_response();
    }

    let chunks = futures_util::stream::iter(
        backend
            .chunks
            .clone()
            .into_iter()
            .map(Ok::<String, Infallible>),
    );
    let stream = if backend.hang {
        chunks.chain(futures_util::stream::pending()).boxed()
    } else {
        chunks.boxed()
    };
    Response::new(Body::from_stream(stream))
}

async fn refresh(State(state): State<Shared>) -> Json<Value> {
    state.lock().unwrap().refresh_calls += 1;
    Json(json!({ "access_token": FRESH_TOKEN }))
}

async fn update(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut backend = state.lock().unwrap();
    backend.update_calls += 1;
    if backend.fail_updates {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "database unavailable" })))
            .into_response();
    }
    let id = body["conversation_id"].as_str().unwrap_or_default().to_string();
    let messages = body["messages"].as_array().cloned().unwrap_or_default();
    backend.stored.insert(id, messages);
    Json(json!({ "success": true })).into_response()
}

async fn read(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let backend = state.lock().unwrap();
    let id = body["conversation_id"].as_str().unwrap_or_default();
    match backend.stored.get(id) {
        Some(messages) => Json(json!({ "conversation_id": id, "messages": messages })).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "Conversation not found" }))).into_response(),
    }
}

async fn record(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut backend = state.lock().unwrap();
    backend.calls.push(RecordedCall {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
        token: bearer(&headers),
    });
    match backend.responses.get(uri.path()) {
        Some((status, body)) => (*status, Json(body.clone())).into_response(),
        None => Json(json!({ "success": true })).into_response(),
    }
}

async fn document() -> Response {
    ([(header::CONTENT_TYPE, "application/pdf")], DOCUMENT).into_response()
}

pub async fn spawn_backend(backend: Backend) -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(backend));
    let app = Router::new()
        .route("/api/chat/history/generate", post(generate))
        .route("/api/chat/history/update", post(update))
        .route("/api/chat/history/read", post(read))
        .route("/api/auth/refresh-token", post(refresh))
        .route("/files/msa.pdf", get(document))
        .fallback(record)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

pub fn api(base_url: &str, token: &str) -> ChatApi {
    let auth = AuthClient::new(reqwest::Client::new(), base_url, Some(token.to_string()));
    ChatApi::new(Arc::new(auth))
}

pub fn session(base_url: &str, token: &str, mode: ResponseMode) -> ChatSession {
    ChatSession::new(api(base_url, token), vec![ContractWorkspace::new("ws-1")], mode)
}

/// Canned answer for `path`, set after the backend is already running.
pub fn respond(backend: &Shared, path: &str, status: StatusCode, body: Value) {
    backend
        .lock()
        .unwrap()
        .responses
        .insert(path.to_string(), (status, body));
}

pub fn last_call(backend: &Shared) -> RecordedCall {
    backend.lock().unwrap().calls.last().cloned().unwrap()
}

pub fn history_metadata() -> Value {
    json!({
        "conversation_id": CONVERSATION_ID,
        "title": "Who is the supplier?",
        "date": "2024-05-01T10:00:00Z"
    })
}

/// One stream object carrying a single message, newline-terminated.
pub fn message_line(role: &str, content: &str, citation_metadata: Option<Value>) -> String {
    let mut message = json!({ "role": role, "content": content });
    if let Some(metadata) = citation_metadata {
        message["citation_metadata"] = metadata;
    }
    let payload = json!({
        "id": "resp-1",
        "choices": [{ "messages": [message] }],
        "history_metadata": history_metadata(),
    });
    format!("{}\n", payload)
}

pub fn acme_citations() -> Value {
    json!({
        "citations": [{
            "file_id": 42,
            "page_number": 2,
            "file_name": "Master Services Agreement.pdf",
            "contract_workspace": "UCW_7_Acme MSA",
            "citation_text": "Supplier: Acme Corporation"
        }]
    })
}

pub fn citation_update_line(metadata: Value) -> String {
    format!(
        "{}\n",
        json!({ "citation_update": true, "citation_metadata": metadata })
    )
}

/// Tool context, two assistant deltas, then the late citation update.
pub fn acme_stream() -> Vec<String> {
    vec![
        message_line("tool", r#"{"retrieved":["msa.pdf"]}"#, None),
        message_line("assistant", "The supplier ", Some(json!({ "citation_loading": true }))),
        message_line("assistant", "is Acme.", None),
        citation_update_line(acme_citations()),
    ]
}

/// Re-cuts a body into chunks of `size` bytes, ignoring line boundaries.
pub fn rechunk(lines: &[String], size: usize) -> Vec<String> {
    let body = lines.concat();
    body.as_bytes()
        .chunks(size)
        .map(|c| String::from_utf8(c.to_vec()).unwrap())
        .collect()
}

/// Role and content of every message, which is what survives identically across runs.
pub fn shape(messages: &[Message]) -> Vec<(Role, String)> {
    messages.iter().map(|m| (m.role, m.content.clone())).collect()
}
