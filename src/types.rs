use serde::de::Error as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum CitelineError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(reqwest::StatusCode, String),

    /// The backend reported an error inside the answer stream.
    #[error("Stream error: {0}")]
    StreamFailure(String),

    #[error("{}", crate::constants::NO_CONTENT_ERROR)]
    ContentMissing,

    #[error("Malformed stream payload: {0}")]
    MalformedStream(String),

    #[error("Access token is missing. Please log in.")]
    MissingToken,

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: CitelineError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<CitelineError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- TRANSCRIPT MODEL ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    Error,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Standard,
    Fast,
}

impl ResponseMode {
    pub fn is_fast(self) -> bool {
        self == Self::Fast
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Fast => write!(f, "fast"),
        }
    }
}

impl std::str::FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "fast" => Ok(Self::Fast),
            other => Err(format!("unknown response mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default)]
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_metadata: Option<CitationMetadata>,
    /// Retrieval context the backend attaches to an assistant delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            date: now_iso(),
            citation_metadata: None,
            context: None,
            contract_id: None,
            contract_workspace: None,
            feedback: None,
        }
    }

    pub fn user(content: impl Into<String>, workspace: Option<&str>) -> Self {
        Self::new(Uuid::new_v4().to_string(), Role::User, content).scoped_to(workspace)
    }

    pub fn error(content: impl Into<String>, workspace: Option<&str>) -> Self {
        Self::new(Uuid::new_v4().to_string(), Role::Error, content).scoped_to(workspace)
    }

    pub fn scoped_to(mut self, workspace: Option<&str>) -> Self {
        self.contract_id = workspace.map(str::to_string);
        self.contract_workspace = workspace.map(str::to_string);
        self
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        Some(s) => Ok(s),
        None => Ok(String::new()),
    }
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Client-side id for messages the backend sent without one: `<unix millis>-<9 base36 chars>`.
pub fn generate_unique_id() -> String {
    let suffix: String = (0..9)
        .map(|_| BASE36[fastrand::usize(..BASE36.len())] as char)
        .collect();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

/// --- CITATIONS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CitationPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Citation {
    #[serde(
        default,
        deserialize_with = "file_id_from_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_id: Option<String>,
    /// Zero-based on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_position: Option<CitationPosition>,
    #[serde(
        default,
        deserialize_with = "normalize_reasoning",
        skip_serializing_if = "Option::is_none"
    )]
    pub reasoning: Option<Vec<String>>,
}

fn file_id_from_string_or_number<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.is_empty() => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(D::Error::custom(format!("invalid file_id: {}", other))),
    }
}

/// Reasoning arrives as a single string or a list; both become a list, blanks become `None`.
fn normalize_reasoning<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.is_empty() => Ok(None),
        serde_json::Value::String(s) => Ok(Some(vec![s])),
        serde_json::Value::Array(items) => {
            let lines = items
                .into_iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(s) => Some(s),
                    serde_json::Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect();
            Ok(Some(lines))
        }
        other => Err(D::Error::custom(format!("invalid reasoning: {}", other))),
    }
}

/// The three shapes a citation payload takes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum CitationMetadata {
    /// `{"citation_loading": true}`: citations are still being resolved.
    Loading,
    /// Flat shape with the citation fields at the top level.
    Single(Citation),
    /// `{"citations": [...]}`
    Multiple(Vec<Citation>),
}

impl CitationMetadata {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn citations(&self) -> &[Citation] {
        match self {
            Self::Loading => &[],
            Self::Single(c) => std::slice::from_ref(c),
            Self::Multiple(list) => list,
        }
    }
}

impl<'de> Deserialize<'de> for CitationMetadata {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.get("citation_loading").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(Self::Loading);
        }
        if let Some(list) = value.get("citations").filter(|v| v.is_array()) {
            let citations = Vec::<Citation>::deserialize(list).map_err(D::Error::custom)?;
            return Ok(Self::Multiple(citations));
        }
        let citation = Citation::deserialize(&value).map_err(D::Error::custom)?;
        Ok(Self::Single(citation))
    }
}

impl Serialize for CitationMetadata {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Loading => {
                let mut s = serializer.serialize_struct("CitationMetadata", 1)?;
                s.serialize_field("citation_loading", &true)?;
                s.end()
            }
            Self::Single(citation) => citation.serialize(serializer),
            Self::Multiple(citations) => {
                let mut s = serializer.serialize_struct("CitationMetadata", 1)?;
                s.serialize_field("citations", citations)?;
                s.end()
            }
        }
    }
}

/// --- CONVERSATIONS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryMetadata {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub date: String,
}

impl Conversation {
    pub fn from_history(meta: HistoryMetadata, messages: Vec<Message>) -> Self {
        Self {
            id: meta.conversation_id,
            title: meta.title,
            messages,
            date: meta.date,
        }
    }
}

/// Body of `POST /chat/history/generate`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
    pub contract_workspace_id: String,
    pub contract_workspace_list: Vec<ContractWorkspace>,
    pub ai_mode: ResponseMode,
}

impl ConversationRequest {
    /// Error messages stay local to the transcript and are never sent back.
    pub fn new(
        messages: &[Message],
        workspaces: &[ContractWorkspace],
        conversation_id: Option<ConversationId>,
        mode: ResponseMode,
    ) -> Self {
        let contract_workspace_id = match workspaces.first() {
            Some(w) => w.id.clone(),
            None => String::new(),
        };
        Self {
            conversation_id,
            messages: messages
                .iter()
                .filter(|m| m.role != Role::Error)
                .cloned()
                .collect(),
            contract_workspace_id,
            contract_workspace_list: workspaces.to_vec(),
            ai_mode: mode,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractWorkspace {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_name: Option<String>,
}

impl ContractWorkspace {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace_name: None,
        }
    }
}

/// --- STREAM WIRE TYPES ---

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub history_metadata: Option<HistoryMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChoice {
    #[serde(default)]
    pub messages: Vec<Message>,
}
