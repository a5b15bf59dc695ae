#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use citeline::api::HistoryStatus;
use citeline::citations::{extract_citations, open_citation};
use citeline::main_helper::{build_client, build_session};
use citeline::reducer::TranscriptSnapshot;
use citeline::*;

use clap::Parser;
use colored::*;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Prints whatever the transcript gained since the last snapshot.
struct Renderer {
    /// Messages below this index were on screen before the turn started.
    start: usize,
    printed: HashMap<String, usize>,
}

impl Renderer {
    fn new(start: usize) -> Self {
        Self {
            start,
            printed: HashMap::new(),
        }
    }

    fn render(&mut self, snapshot: &TranscriptSnapshot) {
        let mut out = std::io::stdout().lock();
        for message in snapshot.messages.iter().skip(self.start) {
            let done = match self.printed.get(&message.id) {
                Some(n) => *n,
                None => {
                    match message.role {
                        Role::Assistant => {
                            let _ = write!(out, "\n{} ", "assistant>".green().bold());
                        }
                        Role::Tool => {
                            let _ = writeln!(out, "{}", "[context retrieved]".dimmed());
                        }
                        Role::Error => {
                            let _ = writeln!(out, "\n{}", message.content.red());
                        }
                        Role::User => {
                            let _ = writeln!(out, "{} {}", "you>".cyan().bold(), message.content);
                        }
                    }
                    0
                }
            };
            let total = match message.role {
                Role::Assistant => {
                    if let Some(tail) = message.content.get(done..) {
                        let _ = write!(out, "{}", tail);
                    }
                    message.content.len()
                }
                _ => message.content.len(),
            };
            self.printed.insert(message.id.clone(), total);
        }
        let _ = out.flush();
    }
}

fn print_citations(conversation: &Conversation, mode: ResponseMode) {
    let answer = match conversation
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
    {
        Some(m) => m,
        None => return,
    };
    let citations = extract_citations(answer, mode);
    if citations.is_empty() {
        return;
    }
    println!("{}", "Sources:".bold());
    for (i, citation) in citations.iter().enumerate() {
        println!("  [{}] {}", i + 1, citation.title);
        if let Some(text) = citation.citation_text.as_deref() {
            println!("      {}", str_utils::snippet(text, 160).dimmed());
        }
    }
}

async fn ask(session: &ChatSession, question: &str) {
    let start = session.transcript().messages().len() + 1;
    let stop = CancellationToken::new();
    let transcript = session.transcript().clone();
    let renderer_stop = stop.clone();
    let renderer = tokio::spawn(async move {
        let mut renderer = Renderer::new(start);
        let mut updates = WatchStream::new(transcript.subscribe());
        loop {
            tokio::select! {
                _ = renderer_stop.cancelled() => break,
                next = updates.next() => match next {
                    Some(snapshot) => renderer.render(&snapshot),
                    None => break,
                },
            }
        }
        renderer.render(&transcript.snapshot());
    });

    let outcome = session.send(question).await;
    stop.cancel();
    if let Err(e) = renderer.await {
        tracing::error!("Renderer task failed: {}", e);
    }
    println!();

    match outcome {
        Ok(TurnOutcome::Completed(conversation)) => {
            print_citations(&conversation, session.mode());
            println!(
                "{}",
                format!("conversation {}", conversation.id).dimmed()
            );
        }
        Ok(TurnOutcome::Cancelled) => println!("{}", "(stopped)".yellow()),
        Ok(TurnOutcome::Failed(_)) => {}
        Err(e) => eprintln!("{} {}", "error:".red().bold(), e.inner),
    }
}

/// Opens source `n` (1-based, as listed under "Sources:") of the latest answer.
async fn show_citation(session: &ChatSession, n: usize) -> Result<()> {
    let messages = session.transcript().messages();
    let citations = match messages.iter().rev().find(|m| m.role == Role::Assistant) {
        Some(answer) => extract_citations(answer, session.mode()),
        None => Vec::new(),
    };
    let citation = match n.checked_sub(1).and_then(|i| citations.get(i)) {
        Some(c) => c,
        None => {
            println!("No source [{}] in the latest answer.", n);
            return Ok(());
        }
    };

    let view = open_citation(session.api(), citation).await?;
    println!("{}", view.citation.title.bold());
    if let Some(text) = view.citation.citation_text.as_deref() {
        println!("  {}", text);
    }
    match (&view.url, &view.document) {
        (Some(url), Some(document)) => {
            println!("  {} ({} bytes)", url.underline(), document.len())
        }
        _ => println!("  {}", "(no document link)".dimmed()),
    }
    Ok(())
}

async fn list_conversations(session: &ChatSession) -> Result<()> {
    let conversations = session.api().history_list(0).await?;
    if conversations.is_empty() {
        println!("No conversations.");
    }
    for conversation in conversations {
        println!(
            "{}  {}  {}",
            conversation.id.as_str().bold(),
            conversation.date.dimmed(),
            conversation.title
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _guard = match logging::init_tracing(&args) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    logging::setup_panic_hook();

    let client = match build_client(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            eprintln!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let session = Arc::new(build_session(&args, client));
    tracing::info!(
        "Citeline started against {} ({} workspaces, mode {})",
        args.base_url,
        session.workspaces().len(),
        session.mode()
    );

    if args.check {
        match session.api().history_ensure().await {
            HistoryStatus::Working => println!("{}", "Chat history is working.".green()),
            other => {
                println!("{} {:?}", "Chat history unavailable:".red(), other);
                std::process::exit(2);
            }
        }
        return;
    }

    if args.list {
        if let Err(e) = list_conversations(&session).await {
            eprintln!("{} {}", "error:".red().bold(), e.inner);
            std::process::exit(1);
        }
        return;
    }

    if let Some(id) = args.conversation_id.as_deref() {
        let id = ConversationId::from(id.to_string());
        if let Err(e) = session.load_conversation(&id).await {
            eprintln!("{} {}", "Could not load conversation:".red().bold(), e.inner);
            std::process::exit(1);
        }
        let mut renderer = Renderer::new(0);
        renderer.render(&session.transcript().snapshot());
        println!();
    }

    let registry = session.registry().clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if registry.cancel_all() == 0 {
                std::process::exit(130);
            }
        }
    });

    if let Some(question) = args.question.as_deref() {
        ask(&session, question).await;
        return;
    }

    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    print!("{} ", "you>".cyan().bold());
    let _ = std::io::stdout().flush();
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        };
        match line.trim() {
            "" => {}
            "/quit" | "/exit" => break,
            "/new" => {
                session.new_chat();
                println!("{}", "(new conversation)".dimmed());
            }
            command if command.starts_with("/cite") => {
                match command["/cite".len()..].trim().parse::<usize>() {
                    Ok(n) => {
                        if let Err(e) = show_citation(&session, n).await {
                            eprintln!("{} {}", "error:".red().bold(), e.inner);
                        }
                    }
                    Err(_) => println!("usage: /cite <source number>"),
                }
            }
            question => ask(&session, question).await,
        }
        print!("{} ", "you>".cyan().bold());
        let _ = std::io::stdout().flush();
    }
}
