use crate::auth::AuthClient;
use crate::constants::*;
use crate::types::*;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Health of the chat-history store as reported by `/chat/history/ensure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    Working,
    NotWorking,
    InvalidCredentials,
    NotConfigured,
    Other(String),
}

/// Source location of a citation as served by `/chat/citation`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CitationData {
    #[serde(default)]
    pub citation_url: Option<String>,
    #[serde(default)]
    pub citation_text: Option<String>,
    #[serde(default)]
    pub citation_position: Option<CitationPosition>,
}

#[derive(Deserialize)]
struct StoredMessage {
    id: String,
    role: Role,
    #[serde(default, rename = "createdAt")]
    created_at: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Deserialize)]
struct StoredConversation {
    #[serde(default)]
    messages: Vec<StoredMessage>,
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        Self {
            id: stored.id,
            role: stored.role,
            content: match stored.content {
                Some(c) => c,
                None => String::new(),
            },
            date: stored.created_at,
            citation_metadata: None,
            context: None,
            contract_id: None,
            contract_workspace: None,
            feedback: stored.feedback,
        }
    }
}

#[derive(Clone)]
pub struct ChatApi {
    auth: Arc<AuthClient>,
}

impl ChatApi {
    pub fn new(auth: Arc<AuthClient>) -> Self {
        Self { auth }
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// Opens the answer stream. Status handling is left to the caller.
    pub async fn history_generate(&self, request: &ConversationRequest) -> Result<reqwest::Response> {
        let url = self.auth.url(HISTORY_GENERATE);
        tracing::info!(
            "[⚙️  -> ☁️ ] Generate: {} messages, mode {}, conversation {}",
            request.messages.len(),
            request.ai_mode,
            match &request.conversation_id {
                Some(id) => id.short().to_string(),
                None => "new".to_string(),
            }
        );
        self.auth.send(|c| c.post(&url).json(request)).await
    }

    pub async fn history_update(&self, messages: &[Message], conversation_id: &ConversationId) -> Result<()> {
        let url = self.auth.url(HISTORY_UPDATE);
        let body = json!({ "conversation_id": conversation_id, "messages": messages });
        let response = self.auth.send(|c| c.post(&url).json(&body)).await?;
        ensure_success(response).await
    }

    pub async fn history_read(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let url = self.auth.url(HISTORY_READ);
        let body = json!({ "conversation_id": conversation_id });
        let response = self.auth.send(|c| c.post(&url).json(&body)).await?;
        let response = check_status(response).await?;
        let stored: StoredConversation = response.json().await?;
        Ok(stored.messages.into_iter().map(Message::from).collect())
    }

    pub async fn history_list(&self, offset: u32) -> Result<Vec<Conversation>> {
        let url = format!("{}?offset={}", self.auth.url(HISTORY_LIST), offset);
        let response = self.auth.send(|c| c.get(&url)).await?;
        let response = check_status(response).await?;
        let list: Option<Vec<Conversation>> = response.json().await?;
        Ok(match list {
            Some(l) => l,
            None => Vec::new(),
        })
    }

    pub async fn history_delete(&self, conversation_id: &ConversationId) -> Result<()> {
        let url = self.auth.url(HISTORY_DELETE);
        let body = json!({ "conversation_id": conversation_id });
        let response = self.auth.send(|c| c.delete(&url).json(&body)).await?;
        ensure_success(response).await
    }

    pub async fn history_delete_all(&self) -> Result<()> {
        let url = self.auth.url(HISTORY_DELETE_ALL);
        let response = self.auth.send(|c| c.delete(&url).json(&json!({}))).await?;
        ensure_success(response).await
    }

    pub async fn history_clear(&self, conversation_id: &ConversationId) -> Result<()> {
        let url = self.auth.url(HISTORY_CLEAR);
        let body = json!({ "conversation_id": conversation_id });
        let response = self.auth.send(|c| c.post(&url).json(&body)).await?;
        ensure_success(response).await
    }

    pub async fn history_rename(&self, conversation_id: &ConversationId, title: &str) -> Result<()> {
        let url = self.auth.url(HISTORY_RENAME);
        let body = json!({ "conversation_id": conversation_id, "title": title });
        let response = self.auth.send(|c| c.post(&url).json(&body)).await?;
        ensure_success(response).await
    }

    pub async fn history_message_feedback(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        feedback: &str,
        additional_feedback: &str,
    ) -> Result<()> {
        let url = self.auth.url(&format!(
            "/chat/threads/{}/messages/{}",
            conversation_id, message_id
        ));
        let body = json!({
            "conversation_id": conversation_id,
            "message_id": message_id,
            "message_feedback": feedback,
            "additional_feedback": additional_feedback,
        });
        let response = self.auth.send(|c| c.post(&url).json(&body)).await?;
        ensure_success(response).await
    }

    /// `page` is the 1-indexed page label shown to the user.
    pub async fn citation_data(&self, file_id: &str, page: u32) -> Result<CitationData> {
        let url = self.auth.url(CITATION);
        let page = page.to_string();
        let response = self
            .auth
            .send(|c| {
                c.get(&url)
                    .query(&[("file_id", file_id), ("page_label", page.as_str())])
            })
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Downloads the cited document. Relative URLs are resolved against the API root.
    pub async fn citation_document(&self, citation_url: &str) -> Result<bytes::Bytes> {
        let url = if citation_url.starts_with("http://") || citation_url.starts_with("https://") {
            citation_url.to_string()
        } else {
            self.auth.url(citation_url)
        };
        let response = self.auth.send(|c| c.get(&url)).await?;
        let response = check_status(response).await?;
        let body = response.bytes().await?;
        tracing::debug!("[☁️  -> ⚙️ ] Citation document: {} bytes", body.len());
        Ok(body)
    }

    pub async fn history_ensure(&self) -> HistoryStatus {
        let url = self.auth.url(HISTORY_ENSURE);
        let response = match self.auth.send(|c| c.get(&url)).await {
            Ok(r) => r,
            Err(e) => {
                return match e.inner {
                    // a plain 401 surfaces from the auth layer as an expired session
                    CitelineError::SessionExpired(_) | CitelineError::MissingToken => {
                        HistoryStatus::InvalidCredentials
                    }
                    other => HistoryStatus::Other(other.to_string()),
                }
            }
        };
        let status = response.status();
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(_) => serde_json::Value::Null,
        };
        if status.is_success() && body.get("message").is_some() {
            HistoryStatus::Working
        } else if status == reqwest::StatusCode::INTERNAL_SERVER_ERROR {
            HistoryStatus::NotWorking
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            HistoryStatus::InvalidCredentials
        } else if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            HistoryStatus::Other(match body.get("error") {
                Some(serde_json::Value::String(e)) => e.clone(),
                Some(e) => e.to_string(),
                None => status.to_string(),
            })
        } else {
            HistoryStatus::NotConfigured
        }
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<()> {
    check_status(response).await.map(|_| ())
}

/// Non-2xx responses become `Upstream` errors carrying the extracted server message.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = match response.text().await {
        Ok(t) => t,
        Err(_) => String::new(),
    };
    let message = extract_server_message(&text);
    tracing::warn!("[☁️  -> ⚙️ ] Backend answered {}: {}", status, message);
    Err(CitelineError::Upstream(status, message).into())
}

/// Pulls `error` out of a JSON error body; falls back to the raw text.
pub fn extract_server_message(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.get("error") {
            Some(serde_json::Value::String(s)) => parse_error_message(s),
            Some(serde_json::Value::Object(map)) => match map.get("message").and_then(|m| m.as_str()) {
                Some(m) => parse_error_message(m),
                None => serde_json::Value::Object(map.clone()).to_string(),
            },
            _ => RETRY_HINT.to_string(),
        },
        Err(_) if body.trim().is_empty() => RETRY_HINT.to_string(),
        Err(_) => body.trim().to_string(),
    }
}

/// Backend errors sometimes wrap a provider error serialized as a Python dict:
/// `"429 - {\'error\': {\'message\': ...}}"`. Keep the code and unescape the dict.
pub fn parse_error_message(error_message: &str) -> String {
    const INNER_ERROR_CUE: &str = r"{\'error\': {\'message\': ";

    let start = match error_message.find(INNER_ERROR_CUE) {
        Some(idx) => idx,
        None => return error_message.to_string(),
    };
    let code = match error_message.find('-') {
        Some(idx) => &error_message[..=idx],
        None => "",
    };
    let mut inner = &error_message[start..];
    if let Some(stripped) = inner.strip_suffix("'}}") {
        inner = stripped;
    }
    format!("{} {}", code, inner.replace(r"\'", "'"))
}
