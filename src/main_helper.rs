#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use crate::api::ChatApi;
use crate::auth::AuthClient;
use crate::session::ChatSession;
use crate::types::*;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Backend root; `/api` is appended.
    #[arg(long, env = "CITELINE_BASE_URL", default_value = "http://127.0.0.1:8000")]
    pub base_url: String,
    #[arg(long, env = "CITELINE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Contract workspace id; repeat for several. The first one scopes new messages.
    #[arg(short = 'w', long = "workspace")]
    pub workspaces: Vec<String>,
    #[arg(long, default_value_t = ResponseMode::Standard)]
    pub mode: ResponseMode,
    /// Continue a stored conversation.
    #[arg(long)]
    pub conversation_id: Option<String>,
    /// Ask a single question and exit.
    #[arg(short, long)]
    pub question: Option<String>,
    /// Whole-request timeout. Streams can be long, so unset by default.
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
    /// List stored conversations and exit.
    #[arg(long, default_value_t = false)]
    pub list: bool,
    /// Check the chat-history store and exit.
    #[arg(long, default_value_t = false)]
    pub check: bool,
}

impl Args {
    pub fn contract_workspaces(&self) -> Vec<ContractWorkspace> {
        self.workspaces
            .iter()
            .filter(|w| !w.trim().is_empty())
            .map(|w| ContractWorkspace::new(w.trim()))
            .collect()
    }
}

pub fn build_client(args: &Args) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)));
    if let Some(secs) = args.request_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    Ok(builder.build()?)
}

pub fn build_session(args: &Args, client: reqwest::Client) -> ChatSession {
    let auth = Arc::new(AuthClient::new(client, &args.base_url, args.token.clone()));
    ChatSession::new(ChatApi::new(auth), args.contract_workspaces(), args.mode)
}
