//! CLI entry point for `mailcore`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use mailcore::classify::Classifier;
use mailcore::compose;
use mailcore::config::{self, Config};
use mailcore::events::LogPublisher;
use mailcore::model::attachment::{Attachment, AttachmentDescriptor};
use mailcore::model::mailbox::{Mailbox, TransportSecurity};
use mailcore::model::message::{Direction, Message};
use mailcore::parser::normalize::{Normalizer, RawBody, RawEnvelope};
use mailcore::pipeline::{Engine, InboundOutcome};
use mailcore::store::memory::MemoryStore;
use mailcore::store::{AttachmentStore, Stores};
use mailcore::transport::smtp::SmtpTransport;

#[derive(Parser)]
#[command(name = "mailcore", version, about = "Email ingestion, threading and delivery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest .eml files into an in-memory mailbox and print the threads
    Ingest {
        files: Vec<PathBuf>,
        /// Address of the receiving mailbox
        #[arg(short, long, default_value = "inbox@localhost.localdomain")]
        mailbox: String,
        #[arg(long, default_value = "INBOX")]
        folder: String,
        #[arg(long)]
        json: bool,
    },
    /// Classify a single .eml file
    Classify {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Compose a message and print its RFC 5322 bytes
    Compose {
        #[command(flatten)]
        draft: Draft,
    },
    /// Compose a message and deliver it over SMTP
    Send {
        #[command(flatten)]
        draft: Draft,
        #[arg(long)]
        smtp_host: String,
        #[arg(long, default_value_t = 465)]
        smtp_port: u16,
        #[arg(long, default_value = "")]
        smtp_user: String,
        #[arg(long, env = "MAILCORE_SMTP_PASSWORD", hide_env_values = true, default_value = "")]
        smtp_password: String,
        /// Upgrade a plaintext connection instead of connecting over TLS
        #[arg(long)]
        starttls: bool,
    },
    /// Write the default configuration file
    InitConfig,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct Draft {
    #[arg(long)]
    from: String,
    #[arg(long, required = true)]
    to: Vec<String>,
    #[arg(long)]
    cc: Vec<String>,
    #[arg(long)]
    bcc: Vec<String>,
    #[arg(short, long)]
    subject: String,
    /// Plain-text body
    #[arg(short, long)]
    body: String,
    /// File holding an HTML alternative
    #[arg(long)]
    html: Option<PathBuf>,
    /// Files to attach
    #[arg(short, long)]
    attach: Vec<PathBuf>,
    /// Protocol Message-ID this message replies to
    #[arg(long)]
    in_reply_to: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Ingest {
            files,
            mailbox,
            folder,
            json,
        } => cmd_ingest(&config, &files, &mailbox, &folder, json).await,
        Commands::Classify { file, json } => cmd_classify(&config, &file, json),
        Commands::Compose { draft } => cmd_compose(&draft).await,
        Commands::Send {
            draft,
            smtp_host,
            smtp_port,
            smtp_user,
            smtp_password,
            starttls,
        } => {
            let mut mailbox = draft_mailbox(&draft);
            mailbox.smtp_host = smtp_host;
            mailbox.smtp_port = smtp_port;
            mailbox.smtp_username = smtp_user;
            mailbox.smtp_password = smtp_password;
            mailbox.security = if starttls {
                TransportSecurity::StartTls
            } else {
                TransportSecurity::Implicit
            };
            cmd_send(&config, &draft, mailbox).await
        }
        Commands::InitConfig => cmd_init_config(&config),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mailcore.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))
}

async fn cmd_ingest(
    config: &Config,
    files: &[PathBuf],
    address: &str,
    folder: &str,
    json: bool,
) -> anyhow::Result<()> {
    let mailbox = Mailbox::new("cli", address);
    let engine = Engine::new(
        Stores::in_memory([mailbox.clone()]),
        config,
        Arc::new(SmtpTransport::new(&config.transport)),
        Arc::new(LogPublisher),
    );

    let mut outcomes = Vec::with_capacity(files.len());
    for path in files {
        let raw = read_file(path)?;
        let outcome = engine
            .process_inbound(&mailbox.id, folder, &RawEnvelope::default(), &RawBody::from_full(raw))
            .await
            .with_context(|| format!("failed to ingest {}", path.display()))?;
        outcomes.push((path, outcome));
    }
    let threads = engine.stores().threads.list_by_mailbox(&mailbox.id).await?;

    if json {
        let report = serde_json::json!({
            "messages": outcomes
                .iter()
                .map(|(path, outcome)| serde_json::json!({ "file": path, "result": outcome }))
                .collect::<Vec<_>>(),
            "threads": threads,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (path, outcome) in &outcomes {
        match outcome {
            InboundOutcome::Stored {
                message_id,
                classification,
                reason,
                thread_id,
                ..
            } => {
                println!("{}", path.display());
                println!("  Message-ID:     {message_id}");
                println!("  Classification: {classification} ({reason})");
                if let Some(thread_id) = thread_id {
                    println!("  Thread:         {thread_id}");
                }
            }
            InboundOutcome::Duplicate { message_id, .. } => {
                println!("{}", path.display());
                println!("  Duplicate of    {message_id}");
            }
        }
    }
    println!();
    println!("Threads: {}", threads.len());
    for thread in &threads {
        println!(
            "  {}  {:>3} msg  {}",
            thread.id, thread.message_count, thread.subject
        );
    }
    Ok(())
}

fn cmd_classify(config: &Config, path: &Path, json: bool) -> anyhow::Result<()> {
    let raw = read_file(path)?;
    let normalized = Normalizer::new(config.subjects.extra_prefixes.clone()).normalize(
        "cli",
        "INBOX",
        &RawEnvelope::default(),
        &RawBody::from_full(raw),
    );
    let verdict = Classifier::new(&config.classifier).classify_normalized(&normalized);

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        println!("{}: {}", verdict.classification, verdict.reason);
    }
    Ok(())
}

fn draft_mailbox(draft: &Draft) -> Mailbox {
    let mut mailbox = Mailbox::new("cli", &draft.from);
    mailbox.outbound_enabled = true;
    mailbox
}

/// Build the outbound message and store its attachments in `store`.
async fn draft_message(
    draft: &Draft,
    store: &dyn AttachmentStore,
) -> anyhow::Result<(Message, Vec<Attachment>)> {
    let mut message = Message::new("cli", Direction::Outbound);
    message.from_address = draft.from.trim().to_lowercase();
    message.to_addresses = draft.to.clone();
    message.cc_addresses = draft.cc.clone();
    message.bcc_addresses = draft.bcc.clone();
    message.subject = draft.subject.clone();
    message.body_text = Some(draft.body.clone());
    message.in_reply_to = draft.in_reply_to.clone();
    if let Some(path) = &draft.html {
        let html = read_file(path)?;
        message.body_html = Some(String::from_utf8_lossy(&html).into_owned());
    }

    let mut attachments = Vec::with_capacity(draft.attach.len());
    for path in &draft.attach {
        let data = read_file(path)?;
        let descriptor = AttachmentDescriptor {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string()),
            content_type: "application/octet-stream".to_string(),
            size: data.len() as u64,
            content_id: None,
            is_inline: false,
            data: None,
        };
        let record = Attachment::from_descriptor(&descriptor, &data);
        attachments.push(store.store(&record, &data).await?);
    }
    message.has_attachment = !attachments.is_empty();
    Ok((message, attachments))
}

async fn cmd_compose(draft: &Draft) -> anyhow::Result<()> {
    use std::io::Write;

    let mailbox = draft_mailbox(draft);
    let store = MemoryStore::new();
    let (message, attachments) = draft_message(draft, &store).await?;
    let composed = compose::compose(&message, &attachments, &mailbox, None, &store).await?;
    std::io::stdout().write_all(&composed.bytes)?;
    Ok(())
}

async fn cmd_send(config: &Config, draft: &Draft, mailbox: Mailbox) -> anyhow::Result<()> {
    let stores = Stores::in_memory([mailbox.clone()]);
    let (message, attachments) = draft_message(draft, stores.attachments.as_ref()).await?;
    let engine = Engine::new(
        stores,
        config,
        Arc::new(SmtpTransport::new(&config.transport)),
        Arc::new(LogPublisher),
    );

    let result = engine.compose_and_send(&mailbox.id, message, &attachments).await;
    if result.success {
        println!("Sent {}", result.message_id.unwrap_or_default());
        Ok(())
    } else {
        anyhow::bail!(
            "send failed: {}",
            result.error_message.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

fn cmd_init_config(config: &Config) -> anyhow::Result<()> {
    config::save_config(config)?;
    if let Some(path) = config::config_file_path() {
        println!("Wrote {}", path.display());
    }
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailcore", &mut std::io::stdout());
    Ok(())
}
