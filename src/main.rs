//! # doctalk CLI
//!
//! ```bash
//! doctalk --config ./config/doctalk.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `doctalk init` | Create the SQLite database and run schema migrations |
//! | `doctalk ingest <path>` | Upload and process a file or every supported file in a directory |
//! | `doctalk session <document>...` | Open a chat session over one document or a collection |
//! | `doctalk ask <session> "<question>"` | Ask a question; streams the answer and citations |
//! | `doctalk continue <session> <message>` | Continue a truncated answer |
//! | `doctalk search <document> "<query>"` | Retrieve fragments without calling the model |
//! | `doctalk serve` | Start the HTTP server |
//! | `doctalk credits balance <user>` | Show balance and ledger |
//! | `doctalk credits grant <user> <amount>` | Apply an idempotent external grant |
//! | `doctalk recover` | Re-dispatch documents stuck mid-pipeline |
//! | `doctalk delete <document>` | Delete a document and its derived data |

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use doctalk::app::Services;
use doctalk::chat::{ContinueRequest, TurnRequest};
use doctalk::config;
use doctalk::events::ChatEvent;
use doctalk::extract::DocFormat;
use doctalk::migrate;
use doctalk::models::{ChatSession, DocumentStatus, Plan, SessionScope, User};
use doctalk::server;
use doctalk::store::{new_id, AccountStore, ChatStore, DocumentStore};

/// Document question answering with inline citations.
#[derive(Parser)]
#[command(name = "doctalk", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/doctalk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Create a user account.
    User {
        id: String,
        #[arg(long, default_value = "free")]
        plan: String,
    },

    /// Upload and process a file, or every supported file under a directory.
    Ingest {
        path: PathBuf,
        /// Owner of the uploaded documents.
        #[arg(long)]
        user: Option<String>,
    },

    /// Open a chat session. More than one document creates a collection.
    Session {
        #[arg(required = true)]
        documents: Vec<String>,
        #[arg(long)]
        user: Option<String>,
        /// Collection name when several documents are given.
        #[arg(long, default_value = "collection")]
        name: String,
    },

    /// Ask a question in a session.
    Ask {
        session: String,
        question: String,
        #[arg(long)]
        user: String,
        /// quick, balanced or thorough.
        #[arg(long)]
        mode: Option<String>,
    },

    /// Continue a truncated assistant message.
    Continue {
        session: String,
        message: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        mode: Option<String>,
    },

    /// Retrieve fragments from a document.
    Search {
        document: String,
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Start the HTTP server.
    Serve,

    /// Credit balance and grants.
    Credits {
        #[command(subcommand)]
        action: CreditsAction,
    },

    /// Re-dispatch documents left in parsing or embedding.
    Recover,

    /// Delete a document.
    Delete { document: String },
}

#[derive(Subcommand)]
enum CreditsAction {
    /// Show balance and recent ledger entries.
    Balance { user: String },
    /// Credit a user for an external event. Replays are no-ops.
    Grant {
        user: String,
        amount: i64,
        #[arg(long, default_value = "monthly_cycle")]
        ref_type: String,
        #[arg(long)]
        ref_id: String,
        #[arg(long, default_value = "manual_grant")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("doctalk=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let services = Arc::new(Services::open(&cfg).await?);

    match cli.command {
        Commands::Init => {}
        Commands::User { id, plan } => {
            services
                .store
                .create_user(&User {
                    id: id.clone(),
                    plan: Plan::parse(&plan),
                    credits_balance: 0,
                    monthly_credits_granted_at: None,
                })
                .await?;
            let granted = services.ledger.ensure_monthly_credits(&id).await?;
            println!("Created user {} ({} credits granted)", id, granted);
        }
        Commands::Ingest { path, user } => {
            ingest_path(&services, &path, user.as_deref()).await?;
        }
        Commands::Session {
            documents,
            user,
            name,
        } => {
            for id in &documents {
                if services.store.get_document(id).await?.is_none() {
                    bail!("document not found: {}", id);
                }
            }
            let scope = if documents.len() == 1 {
                SessionScope::Document(documents[0].clone())
            } else {
                let collection_id = new_id();
                services
                    .store
                    .create_collection(&collection_id, user.as_deref(), &name, &documents)
                    .await?;
                SessionScope::Collection {
                    collection_id,
                    document_ids: documents,
                }
            };
            let session = ChatSession {
                id: new_id(),
                user_id: user,
                scope,
                title: None,
            };
            services.store.create_session(&session).await?;
            println!("{}", session.id);
        }
        Commands::Ask {
            session,
            question,
            user,
            mode,
        } => {
            let rx = services.chat.chat(TurnRequest {
                session_id: session,
                user_id: user,
                message: question,
                mode,
            });
            print_events(rx).await?;
        }
        Commands::Continue {
            session,
            message,
            user,
            mode,
        } => {
            let rx = services.chat.continue_message(ContinueRequest {
                session_id: session,
                user_id: user,
                message_id: message,
                mode,
            });
            print_events(rx).await?;
        }
        Commands::Search {
            document,
            query,
            top_k,
        } => {
            let top_k = top_k.unwrap_or_else(|| services.retriever.default_top_k(false));
            let results = services
                .retriever
                .search(&query, &[document], top_k, false)
                .await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, r) in results.iter().enumerate() {
                let preview: String = r.text.chars().take(160).collect();
                println!(
                    "{}. [{:.3}] page {}{}",
                    i + 1,
                    r.similarity_score,
                    r.page,
                    r.section_title
                        .as_deref()
                        .map(|t| format!(" ({})", t))
                        .unwrap_or_default()
                );
                println!("    {}", preview.replace('\n', " "));
            }
        }
        Commands::Serve => {
            let report = services.ingest.recover_stuck().await?;
            if !report.redispatched.is_empty() || !report.failed.is_empty() {
                tracing::info!(
                    redispatched = report.redispatched.len(),
                    failed = report.failed.len(),
                    "startup recovery finished"
                );
            }
            server::run_server(services).await?;
        }
        Commands::Credits { action } => match action {
            CreditsAction::Balance { user } => {
                let balance = services.ledger.balance(&user).await?;
                println!("Balance: {}", balance);
                for e in services.ledger.ledger(&user).await?.iter().take(20) {
                    println!(
                        "  {}  {:>+8}  {:>8}  {}{}",
                        e.created_at.format("%Y-%m-%d %H:%M"),
                        e.delta,
                        e.balance_after,
                        e.reason,
                        e.ref_type
                            .as_deref()
                            .map(|t| format!(" ({}:{})", t, e.ref_id.as_deref().unwrap_or("")))
                            .unwrap_or_default()
                    );
                }
            }
            CreditsAction::Grant {
                user,
                amount,
                ref_type,
                ref_id,
                reason,
            } => {
                let applied = services
                    .ledger
                    .grant_external(&user, amount, &reason, &ref_type, &ref_id)
                    .await?;
                if applied {
                    println!("Granted {} credits to {}", amount, user);
                } else {
                    println!("Grant {}:{} already applied", ref_type, ref_id);
                }
            }
        },
        Commands::Recover => {
            let report = services.ingest.recover_stuck().await?;
            println!(
                "Recovered {} document(s), {} failed",
                report.redispatched.len(),
                report.failed.len()
            );
        }
        Commands::Delete { document } => {
            match services.teardown.delete(&document, None).await? {
                Some(report) => {
                    let failed = services.teardown.retries().drain().await;
                    println!(
                        "Deleted {} ({} cleanup(s) retried, {} permanently failed)",
                        report.document_id,
                        report.queued.len(),
                        failed
                    );
                }
                None => bail!("document not found: {}", document),
            }
        }
    }

    Ok(())
}

async fn ingest_path(services: &Services, path: &Path, user: Option<&str>) -> Result<()> {
    let files: Vec<PathBuf> = if path.is_dir() {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| DocFormat::detect("", n))
                    .is_some()
            })
            .collect()
    } else {
        vec![path.to_path_buf()]
    };
    if files.is_empty() {
        bail!("no supported documents under {}", path.display());
    }

    let mut ready = 0;
    for file in &files {
        let doc = services.ingest.ingest_file(user, file).await?;
        match doc.status {
            DocumentStatus::Ready => {
                ready += 1;
                println!(
                    "{}  {}  ({} pages, {} chunks)",
                    doc.id,
                    doc.filename,
                    doc.page_count,
                    doc.chunks_total
                );
            }
            _ => println!(
                "{}  {}  error: {}",
                doc.id,
                doc.filename,
                doc.error_msg.as_deref().unwrap_or("unknown")
            ),
        }
    }
    println!("Ingested {}/{} document(s).", ready, files.len());
    Ok(())
}

/// Tokens go straight to stdout; citations are listed once the turn ends.
async fn print_events(mut rx: mpsc::Receiver<ChatEvent>) -> Result<()> {
    let mut stdout = std::io::stdout();
    let mut citations = Vec::new();
    let mut failed = None;

    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::Token { text } => {
                print!("{}", text);
                stdout.flush()?;
            }
            ChatEvent::Citation(c) => citations.push(c),
            ChatEvent::Ping => {}
            ChatEvent::Truncated { reason } => println!("\n[truncated: {}]", reason),
            ChatEvent::Warn { code, message } => eprintln!("warning {}: {}", code, message),
            ChatEvent::Error { code, message } => failed = Some(format!("{}: {}", code, message)),
            ChatEvent::Done {
                message_id,
                can_continue,
                ..
            } => {
                println!();
                for c in &citations {
                    let snippet: String = c.text_snippet.chars().take(60).collect();
                    println!("  [{}] page {}  {}", c.ref_index, c.page, snippet);
                }
                println!("message {}{}", message_id, if can_continue { " (can continue)" } else { "" });
            }
        }
    }

    match failed {
        Some(err) => bail!("{}", err),
        None => Ok(()),
    }
}
