mod common;

use axum::http::{Method, StatusCode};
use citeline::api::HistoryStatus;
use citeline::citations::{extract_citations, open_citation};
use citeline::*;
use common::*;
use serde_json::json;

#[tokio::test]
async fn test_history_list_reads_page_and_offset() {
    let (url, backend) = spawn_backend(Backend::default()).await;
    respond(
        &backend,
        "/api/chat/history/list",
        StatusCode::OK,
        json!([{ "id": CONVERSATION_ID, "title": "Supplier", "date": "2024-05-01T10:00:00Z" }]),
    );
    let api = api(&url, "good-token");

    let conversations = api.history_list(20).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].id.as_str(), CONVERSATION_ID);
    assert_eq!(conversations[0].title, "Supplier");
    assert!(conversations[0].messages.is_empty());

    let call = last_call(&backend);
    assert_eq!(call.method, Method::GET);
    assert_eq!(call.query.as_deref(), Some("offset=20"));
    assert_eq!(call.token, "good-token");
}

#[tokio::test]
async fn test_history_list_null_is_empty() {
    let (url, backend) = spawn_backend(Backend::default()).await;
    respond(&backend, "/api/chat/history/list", StatusCode::OK, serde_json::Value::Null);
    let conversations = api(&url, "good-token").history_list(0).await.unwrap();
    assert!(conversations.is_empty());
}

#[tokio::test]
async fn test_conversation_management_requests() {
    let (url, backend) = spawn_backend(Backend::default()).await;
    let api = api(&url, "good-token");
    let id = ConversationId::from(CONVERSATION_ID);

    api.history_delete(&id).await.unwrap();
    let call = last_call(&backend);
    assert_eq!(call.method, Method::DELETE);
    assert_eq!(call.path, "/api/chat/history/delete");
    assert_eq!(call.body, json!({ "conversation_id": CONVERSATION_ID }));

    api.history_delete_all().await.unwrap();
    let call = last_call(&backend);
    assert_eq!(call.method, Method::DELETE);
    assert_eq!(call.path, "/api/chat/history/delete_all");
    assert_eq!(call.body, json!({}));

    api.history_clear(&id).await.unwrap();
    let call = last_call(&backend);
    assert_eq!(call.method, Method::POST);
    assert_eq!(call.path, "/api/chat/history/clear");
    assert_eq!(call.body, json!({ "conversation_id": CONVERSATION_ID }));

    api.history_rename(&id, "Acme supplier").await.unwrap();
    let call = last_call(&backend);
    assert_eq!(call.method, Method::POST);
    assert_eq!(call.path, "/api/chat/history/rename");
    assert_eq!(
        call.body,
        json!({ "conversation_id": CONVERSATION_ID, "title": "Acme supplier" })
    );
}

#[tokio::test]
async fn test_message_feedback_uses_thread_path() {
    let (url, backend) = spawn_backend(Backend::default()).await;
    api(&url, "good-token")
        .history_message_feedback(
            &ConversationId::from(CONVERSATION_ID),
            "msg-7",
            "negative",
            "wrong page",
        )
        .await
        .unwrap();

    let call = last_call(&backend);
    assert_eq!(call.method, Method::POST);
    assert_eq!(call.path, "/api/chat/threads/conv-1/messages/msg-7");
    assert_eq!(
        call.body,
        json!({
            "conversation_id": CONVERSATION_ID,
            "message_id": "msg-7",
            "message_feedback": "negative",
            "additional_feedback": "wrong page",
        })
    );
}

#[tokio::test]
async fn test_failed_management_call_carries_server_message() {
    let (url, backend) = spawn_backend(Backend::default()).await;
    respond(
        &backend,
        "/api/chat/history/rename",
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "database unavailable" }),
    );
    let result = api(&url, "good-token")
        .history_rename(&ConversationId::from(CONVERSATION_ID), "x")
        .await;

    match result {
        Err(e) => match e.inner {
            CitelineError::Upstream(status, message) => {
                assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(message, "database unavailable");
            }
            other => panic!("Expected Upstream, got {:?}", other),
        },
        Ok(()) => panic!("Expected an error"),
    }
}

#[tokio::test]
async fn test_history_ensure_maps_each_status() {
    let cases = vec![
        (StatusCode::OK, json!({ "message": "CosmosDB is configured and working" }), HistoryStatus::Working),
        (StatusCode::INTERNAL_SERVER_ERROR, json!({}), HistoryStatus::NotWorking),
        (StatusCode::UNAUTHORIZED, json!({ "error": "bad credentials" }), HistoryStatus::InvalidCredentials),
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "error": "database not found" }),
            HistoryStatus::Other("database not found".to_string()),
        ),
        (StatusCode::NOT_FOUND, json!({}), HistoryStatus::NotConfigured),
    ];

    for (status, body, expected) in cases {
        let (url, backend) = spawn_backend(Backend::default()).await;
        respond(&backend, "/api/chat/history/ensure", status, body);
        let actual = api(&url, "good-token").history_ensure().await;
        assert_eq!(actual, expected, "status {}", status);
        assert_eq!(last_call(&backend).method, Method::GET);
    }
}

#[tokio::test]
async fn test_open_citation_fetches_location_and_document() {
    let (url, backend) = spawn_backend(Backend {
        chunks: acme_stream(),
        ..Default::default()
    })
    .await;
    respond(
        &backend,
        "/api/chat/citation",
        StatusCode::OK,
        json!({
            "citation_url": format!("{}/files/msa.pdf", url),
            "citation_text": "Supplier: Acme Corporation, Delaware",
            "citation_position": { "page": 3, "x": 72.0, "y": 144.0 }
        }),
    );
    let session = session(&url, "good-token", ResponseMode::Standard);
    let conversation = match session.send("Who is the supplier?").await.unwrap() {
        TurnOutcome::Completed(c) => c,
        other => panic!("Expected Completed, got {:?}", other),
    };
    let citation = extract_citations(&conversation.messages[2], ResponseMode::Standard).remove(0);

    let view = open_citation(session.api(), &citation).await.unwrap();
    assert_eq!(view.url, Some(format!("{}/files/msa.pdf", url)));
    assert_eq!(view.document.as_deref(), Some(DOCUMENT));
    assert_eq!(
        view.citation.citation_text.as_deref(),
        Some("Supplier: Acme Corporation, Delaware")
    );
    assert_eq!(
        view.citation.citation_position.as_ref().and_then(|p| p.x),
        Some(72.0)
    );
    assert_eq!(view.citation.page, 3);

    let call = last_call(&backend);
    assert_eq!(call.method, Method::GET);
    assert_eq!(call.path, "/api/chat/citation");
    assert_eq!(call.query.as_deref(), Some("file_id=42&page_label=3"));
}

#[tokio::test]
async fn test_open_citation_without_url_skips_download() {
    let (url, backend) = spawn_backend(Backend {
        chunks: acme_stream(),
        ..Default::default()
    })
    .await;
    respond(&backend, "/api/chat/citation", StatusCode::OK, json!({ "citation_url": "" }));
    let session = session(&url, "good-token", ResponseMode::Standard);
    session.send("Who is the supplier?").await.unwrap();
    let answer = session.transcript().messages()[2].clone();
    let citation = extract_citations(&answer, ResponseMode::Standard).remove(0);

    let view = open_citation(session.api(), &citation).await.unwrap();
    assert_eq!(view.url, None);
    assert_eq!(view.document, None);
    assert_eq!(view.citation, citation);
}

#[tokio::test]
async fn test_open_citation_reports_lookup_failure() {
    let (url, backend) = spawn_backend(Backend::default()).await;
    respond(
        &backend,
        "/api/chat/citation",
        StatusCode::NOT_FOUND,
        json!({ "error": "file not found" }),
    );
    let mut message = Message::new("a1", Role::Assistant, "Acme");
    message.citation_metadata = Some(CitationMetadata::Multiple(vec![Citation {
        file_id: Some("42".into()),
        page_number: Some(2),
        ..Default::default()
    }]));
    let citation = extract_citations(&message, ResponseMode::Standard).remove(0);

    let result = open_citation(&api(&url, "good-token"), &citation).await;
    match result {
        Err(e) => assert!(matches!(e.inner, CitelineError::Upstream(_, ref m) if m == "file not found")),
        Ok(view) => panic!("Expected an error, got {:?}", view),
    }
    // no document request after a failed lookup
    assert_eq!(backend.lock().unwrap().calls.len(), 1);
}
