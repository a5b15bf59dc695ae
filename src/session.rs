use crate::api::{check_status, parse_error_message, ChatApi};
use crate::cancellation::{CancellationRegistry, RequestGuard};
use crate::classifier::FragmentMerger;
use crate::constants::*;
use crate::decoder::decode_fragments;
use crate::logging::StreamMetric;
use crate::reducer::{Transcript, TurnState};
use crate::types::*;
use futures_util::StreamExt;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(Conversation),
    /// Stopped by the user; nothing was reported as an error.
    Cancelled,
    /// An `error` message carrying this text was appended to the transcript.
    Failed(String),
}

/// One chat screen: transcript, selected workspaces, response mode and in-flight requests.
pub struct ChatSession {
    api: ChatApi,
    transcript: Transcript,
    registry: CancellationRegistry,
    workspaces: Vec<ContractWorkspace>,
    mode: ResponseMode,
}

impl ChatSession {
    pub fn new(api: ChatApi, workspaces: Vec<ContractWorkspace>, mode: ResponseMode) -> Self {
        Self {
            api,
            transcript: Transcript::new(),
            registry: CancellationRegistry::new(),
            workspaces,
            mode,
        }
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    pub fn workspaces(&self) -> &[ContractWorkspace] {
        &self.workspaces
    }

    /// Switching modes starts over with an empty conversation.
    pub fn set_mode(&mut self, mode: ResponseMode) {
        self.mode = mode;
        self.new_chat();
    }

    pub fn set_workspaces(&mut self, workspaces: Vec<ContractWorkspace>) {
        self.workspaces = workspaces;
    }

    fn primary_workspace(&self) -> Option<String> {
        self.workspaces.first().map(|w| w.id.clone())
    }

    pub fn stop_generating(&self) -> usize {
        self.registry.cancel_all()
    }

    pub fn new_chat(&self) {
        self.transcript.clear();
    }

    /// Replaces the transcript with a stored conversation.
    pub async fn load_conversation(&self, id: &ConversationId) -> Result<()> {
        let messages = match self.api.history_read(id).await {
            Ok(m) => m,
            Err(e) => {
                self.transcript.clear();
                return Err(e);
            }
        };
        tracing::info!(
            "[☁️  -> ⚙️ ] Loaded conversation {} ({} messages)",
            id.short(),
            messages.len()
        );
        let conversation = Conversation {
            id: id.clone(),
            title: String::new(),
            messages: messages.clone(),
            date: String::new(),
        };
        self.transcript.update(move |snap| {
            snap.messages = messages;
            snap.citation_loading = None;
            snap.conversation = Some(conversation);
        });
        Ok(())
    }

    /// Asks `question` in the current conversation and streams the answer into the transcript.
    pub async fn send(&self, question: &str) -> Result<TurnOutcome> {
        let question = question.trim();
        if question.is_empty() {
            return Err(CitelineError::Protocol("question is empty".to_string()).into());
        }
        if self.workspaces.is_empty() {
            return Err(
                CitelineError::Protocol("no contract workspace selected".to_string()).into(),
            );
        }

        let turn_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("turn", turn_id = %turn_id);
        self.run_turn(question, &turn_id).instrument(span).await
    }

    async fn run_turn(&self, question: &str, turn_id: &str) -> Result<TurnOutcome> {
        let guard = self.registry.register();
        let workspace = self.primary_workspace();
        let conversation_id = self
            .transcript
            .snapshot()
            .conversation
            .as_ref()
            .map(|c| c.id.clone());

        let user = Message::user(question, workspace.as_deref());
        let mut turn = TurnState::begin(&self.transcript, user, self.mode, workspace);
        let request =
            ConversationRequest::new(turn.base(), &self.workspaces, conversation_id, self.mode);

        let streamed = self.stream_turn(&request, &mut turn, &guard, turn_id).await;

        if guard.is_cancelled() {
            if let Err(e) = &streamed {
                tracing::debug!("[⚙️ ] Error after cancellation ignored: {}", e.inner);
            }
            return Ok(self.settle_cancelled(&turn));
        }

        let finished = match streamed {
            Ok(()) => turn.finish(&self.transcript),
            Err(e) => Err(e),
        };
        match finished {
            Ok(conversation) => {
                self.persist(&conversation).await;
                Ok(TurnOutcome::Completed(conversation))
            }
            Err(e) => Ok(self.settle_failure(&turn, e).await),
        }
    }

    async fn stream_turn(
        &self,
        request: &ConversationRequest,
        turn: &mut TurnState,
        guard: &RequestGuard,
        turn_id: &str,
    ) -> Result<()> {
        let token = guard.token().clone();

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!("[⚙️ ] Stopped before the backend answered");
                return Ok(());
            }
            response = self.api.history_generate(request) => response?,
        };
        let response = check_status(response).await?;

        let mut fragments = Box::pin(decode_fragments(Box::pin(response.bytes_stream())));
        let mut merger = FragmentMerger::new();
        let mut metric = StreamMetric::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::info!("[⚙️ ] Stream stopped by user");
                    break;
                }
                next = fragments.next() => next,
            };
            let fragment = match next {
                Some(Ok(fragment)) => fragment,
                Some(Err(e)) => return Err(e),
                None => break,
            };

            metric.record_fragment();
            if metric.fragments > MAX_STREAM_FRAGMENTS {
                tracing::error!(
                    "[☁️  -> ⚙️ ] Stream exceeded max fragment limit ({})",
                    MAX_STREAM_FRAGMENTS
                );
                return Err(CitelineError::Internal(
                    "Stream exceeded max fragment limit".to_string(),
                    tracing_error::SpanTrace::capture(),
                )
                .into());
            }

            let events = merger.push(&fragment)?;
            if token.is_cancelled() {
                break;
            }
            for event in events {
                metric.record_event(&event);
                turn.apply(event, &self.transcript)?;
            }
        }

        if !merger.pending().is_empty() && !token.is_cancelled() {
            tracing::warn!(
                "[☁️  -> ⚙️ ] Stream ended with {} chars of incomplete JSON",
                merger.pending().len()
            );
        }
        metric.log_summary(turn_id);
        Ok(())
    }

    /// Keeps the streamed answer only when its citations already arrived.
    fn settle_cancelled(&self, turn: &TurnState) -> TurnOutcome {
        let keep = turn.citations_final() && turn.assistant().is_some();
        let base = turn.base().to_vec();
        self.transcript.update(move |snap| {
            if !keep {
                snap.messages = base;
            }
            snap.citation_loading = None;
        });
        tracing::info!("[⚙️ ] Turn cancelled (answer kept: {})", keep);
        TurnOutcome::Cancelled
    }

    async fn settle_failure(&self, turn: &TurnState, error: ObservedError) -> TurnOutcome {
        let text = user_facing_error(&error.inner);
        tracing::error!("[⚙️ ] Turn failed: {}", error);

        let mut messages = turn.base().to_vec();
        messages.push(Message::error(text.clone(), self.primary_workspace().as_deref()));

        let conversation = match &self.transcript.snapshot().conversation {
            Some(existing) => Some(Conversation {
                messages: messages.clone(),
                ..existing.clone()
            }),
            None => turn
                .history()
                .cloned()
                .map(|h| Conversation::from_history(h, messages.clone())),
        };

        let record = conversation.clone();
        self.transcript.update(move |snap| {
            snap.messages = messages;
            snap.citation_loading = None;
            if record.is_some() {
                snap.conversation = record;
            }
        });

        if let Some(conversation) = conversation {
            self.persist(&conversation).await;
        }
        TurnOutcome::Failed(text)
    }

    /// Saves the conversation once; a failure is reported in the transcript, never retried.
    async fn persist(&self, conversation: &Conversation) {
        let messages = self.transcript.messages();
        if !should_persist(&messages) {
            tracing::debug!("[⚙️ ] Not saving conversation holding a no-content error");
            return;
        }
        match self.api.history_update(&messages, &conversation.id).await {
            Ok(()) => tracing::debug!(
                "[⚙️  -> ☁️ ] Saved conversation {} ({} messages)",
                conversation.id.short(),
                messages.len()
            ),
            Err(e) => {
                tracing::warn!(
                    "[⚙️  -> ☁️ ] Saving conversation {} failed: {}",
                    conversation.id.short(),
                    e.inner
                );
                self.transcript.push(Message::error(
                    SAVE_FAILED_ERROR,
                    self.primary_workspace().as_deref(),
                ));
            }
        }
    }
}

fn should_persist(messages: &[Message]) -> bool {
    !messages
        .iter()
        .any(|m| m.role == Role::Error && m.content.contains(NO_CONTENT_ERROR))
}

/// Text of the `error` message shown for a failed turn.
pub fn user_facing_error(error: &CitelineError) -> String {
    match error {
        CitelineError::Upstream(_, message) => {
            format!("{} {}", GENERATE_FAILED_PREFIX, message)
        }
        CitelineError::StreamFailure(message) => parse_error_message(message),
        CitelineError::ContentMissing => format!("An error occurred. {}", NO_CONTENT_ERROR),
        CitelineError::SessionExpired(_) | CitelineError::MissingToken => {
            format!("Your session has expired. Please log in again. ({})", error)
        }
        _ => format!("An error occurred. {}", RETRY_HINT),
    }
}
