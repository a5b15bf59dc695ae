use crate::classifier::StreamEvent;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::watch;

/// What observers render: always a complete list, never a partial edit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptSnapshot {
    pub messages: Vec<Message>,
    /// Id of the assistant message whose citations are still being resolved.
    pub citation_loading: Option<String>,
    pub conversation: Option<Conversation>,
}

/// Shared transcript. Every mutation publishes a fresh snapshot; the last writer wins.
#[derive(Clone)]
pub struct Transcript {
    tx: Arc<watch::Sender<Arc<TranscriptSnapshot>>>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(TranscriptSnapshot::default()));
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TranscriptSnapshot>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<TranscriptSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.tx.borrow().messages.clone()
    }

    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut TranscriptSnapshot),
    {
        // runs under the channel's write lock; `edit` must not read the transcript
        self.tx.send_modify(|current| edit(Arc::make_mut(current)));
    }

    pub fn replace_messages(&self, messages: Vec<Message>) {
        self.update(|snap| snap.messages = messages);
    }

    pub fn push(&self, message: Message) {
        self.update(|snap| snap.messages.push(message));
    }

    pub fn set_citation_loading(&self, id: Option<String>) {
        if self.tx.borrow().citation_loading == id {
            return;
        }
        self.update(|snap| snap.citation_loading = id);
    }

    pub fn set_conversation(&self, conversation: Option<Conversation>) {
        self.update(|snap| snap.conversation = conversation);
    }

    pub fn clear(&self) {
        self.tx.send_replace(Arc::new(TranscriptSnapshot::default()));
    }
}

/// Accumulator for one in-flight turn. Owned by the request that streams it.
#[derive(Debug)]
pub struct TurnState {
    mode: ResponseMode,
    workspace: Option<String>,
    /// Transcript as it was when the turn started, user message included.
    base: Vec<Message>,
    user: Message,
    assistant: Option<Message>,
    tool: Option<Message>,
    assistant_content: String,
    history: Option<HistoryMetadata>,
    citations_final: bool,
}

impl TurnState {
    /// Appends the user message to the transcript and starts tracking the turn.
    pub fn begin(
        transcript: &Transcript,
        user: Message,
        mode: ResponseMode,
        workspace: Option<String>,
    ) -> Self {
        let mut base = transcript.messages();
        base.push(user.clone());
        transcript.replace_messages(base.clone());
        Self {
            mode,
            workspace,
            base,
            user,
            assistant: None,
            tool: None,
            assistant_content: String::new(),
            history: None,
            citations_final: false,
        }
    }

    pub fn user(&self) -> &Message {
        &self.user
    }

    pub fn assistant(&self) -> Option<&Message> {
        self.assistant.as_ref()
    }

    pub fn tool(&self) -> Option<&Message> {
        self.tool.as_ref()
    }

    pub fn history(&self) -> Option<&HistoryMetadata> {
        self.history.as_ref()
    }

    /// True while the most recent event was a citation update.
    pub fn citations_final(&self) -> bool {
        self.citations_final
    }

    /// Messages present before the turn produced any answer.
    pub fn base(&self) -> &[Message] {
        &self.base
    }

    pub fn apply(&mut self, event: StreamEvent, transcript: &Transcript) -> Result<()> {
        match event {
            StreamEvent::MessageDelta(delta) => {
                self.citations_final = false;
                match delta.role {
                    Role::Assistant => self.apply_assistant(delta, transcript),
                    Role::Tool => self.apply_tool(delta),
                    other => {
                        tracing::warn!("[⚙️ ] Ignoring {} delta in answer stream", other);
                        return Ok(());
                    }
                }
                transcript.replace_messages(self.live_messages());
            }
            StreamEvent::CitationUpdate(metadata) => {
                self.citations_final = true;
                self.apply_citation_update(metadata, transcript);
            }
            StreamEvent::History(history) => {
                self.history = Some(history);
            }
            StreamEvent::Failure(message) => {
                return Err(CitelineError::StreamFailure(message).into());
            }
        }
        Ok(())
    }

    fn apply_assistant(&mut self, mut delta: Message, transcript: &Transcript) {
        self.assistant_content.push_str(&delta.content);

        if let Some(context) = delta.context.take() {
            if self.tool.is_none() {
                let mut tool = Message::new(generate_unique_id(), Role::Tool, context);
                tool.contract_id = delta.contract_id.clone();
                tool.contract_workspace = delta.contract_workspace.clone();
                self.tool = Some(tool);
            }
        }

        let mut running = match self.assistant.take() {
            Some(mut running) => {
                if delta.citation_metadata.is_some() {
                    running.citation_metadata = delta.citation_metadata.take();
                }
                running
            }
            None => {
                if delta.id.is_empty() {
                    delta.id = generate_unique_id();
                }
                if delta.contract_workspace.is_none() {
                    delta = delta.scoped_to(self.workspace.as_deref());
                }
                delta
            }
        };
        running.content = self.assistant_content.clone();

        if self.mode.is_fast() {
            transcript.set_citation_loading(None);
        } else if matches!(running.citation_metadata, Some(CitationMetadata::Loading)) {
            transcript.set_citation_loading(Some(running.id.clone()));
        }

        self.assistant = Some(running);
    }

    fn apply_tool(&mut self, mut delta: Message) {
        if delta.id.is_empty() {
            delta.id = generate_unique_id();
        }
        self.tool = Some(delta);
    }

    fn apply_citation_update(
        &mut self,
        metadata: Option<CitationMetadata>,
        transcript: &Transcript,
    ) {
        let id = match &self.assistant {
            Some(a) => a.id.clone(),
            None => {
                tracing::debug!("[⚙️ ] Citation update before any assistant message; dropped");
                return;
            }
        };

        let on_screen = transcript
            .snapshot()
            .messages
            .iter()
            .any(|m| m.id == id && m.role == Role::Assistant);
        if !on_screen {
            tracing::debug!("[⚙️ ] Assistant message {} not in transcript; citation update dropped", id);
            return;
        }

        if let Some(assistant) = self.assistant.as_mut() {
            assistant.citation_metadata = metadata.clone();
        }
        transcript.update(|snap| {
            for message in snap.messages.iter_mut() {
                if message.id == id && message.role == Role::Assistant {
                    message.citation_metadata = metadata.clone();
                }
            }
            snap.citation_loading = None;
        });
    }

    /// `base ++ [tool?, assistant?]`
    pub fn live_messages(&self) -> Vec<Message> {
        let mut messages = self.base.clone();
        if let Some(tool) = &self.tool {
            messages.push(tool.clone());
        }
        if let Some(assistant) = &self.assistant {
            messages.push(assistant.clone());
        }
        messages
    }

    /// Materializes the finished turn and the conversation record it belongs to.
    pub fn finish(&self, transcript: &Transcript) -> Result<Conversation> {
        if self.assistant.is_none() {
            return Err(CitelineError::ContentMissing.into());
        }
        let messages = self.live_messages();

        let conversation = match &transcript.snapshot().conversation {
            Some(existing) => {
                let mut conversation = existing.clone();
                conversation.messages = messages.clone();
                conversation
            }
            None => match &self.history {
                Some(history) => Conversation::from_history(history.clone(), messages.clone()),
                None => {
                    return Err(CitelineError::Protocol(
                        "stream finished without history metadata".to_string(),
                    )
                    .into())
                }
            },
        };

        tracing::debug!(
            "[⚙️ ] Turn finished for conversation {} ({} messages)",
            conversation.id.short(),
            messages.len()
        );
        let record = conversation.clone();
        transcript.update(move |snap| {
            snap.messages = messages;
            snap.conversation = Some(record);
        });
        Ok(conversation)
    }
}
