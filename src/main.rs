#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, LevelFilter};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod credentials;
mod utils;

use crate::credentials::{
    load_credentials, save_credentials, set_credentials_path_override, Credentials,
};
use coursechat::{
    ChatEngine, ConnectionState, CurrentUser, EngineConfig, EngineEvent, MessageStatus,
    StaticCredentials,
};

/// Command line arguments for coursechat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "coursechat: a command-line client for course chat.",
    long_about = "coursechat sends course chat messages with retry, resolves recipients by id or name \
    and browses conversations.\n\n\
    The bearer token comes from COURSECHAT_TOKEN / COURSECHAT_USER_ID, then saved credentials \
    (see `login`), then a prompt."
)]
struct Args {
    /// JSON engine configuration; COURSECHAT_* environment variables override it
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Credentials file to use instead of the per-user config directory
    #[arg(long, value_name = "PATH")]
    credentials: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save a bearer token and user for later runs
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Send a message and wait until it is acknowledged or fails
    Send {
        /// Numeric user id or display name
        receiver: String,
        #[arg(long)]
        course: i64,
        content: String,
        /// Seconds to wait for the final outcome
        #[arg(long, default_value_t = 120)]
        wait: u64,
    },
    /// Show which user an identifier resolves to
    Resolve {
        identifier: String,
        #[arg(long)]
        course: Option<i64>,
    },
    /// List conversations
    Conversations {
        #[arg(long)]
        refresh: bool,
    },
    /// Show the history with one user and mark it read
    History {
        other_user_id: String,
        #[arg(long)]
        course: i64,
        #[arg(long)]
        keep_unread: bool,
    },
    /// Print incoming messages from the streaming connection until interrupted
    Listen,
}

/// Token from the environment, then saved credentials, then a prompt.
fn credential_provider() -> Result<StaticCredentials> {
    if let (Ok(token), Ok(user_id)) = (env::var("COURSECHAT_TOKEN"), env::var("COURSECHAT_USER_ID")) {
        debug!("Using credentials from the environment");
        let user = CurrentUser {
            id: Some(user_id),
            name: env::var("COURSECHAT_USER_NAME").ok(),
        };
        return Ok(StaticCredentials::new(Some(token), Some(user)));
    }

    if let Some(creds) = load_credentials()? {
        return Ok(creds.into_provider());
    }

    eprintln!("Enter bearer token:");
    let token = utils::read_line()?;
    eprintln!("Enter your user id:");
    let user_id = utils::read_line()?;
    if token.is_empty() || user_id.is_empty() {
        return Err(anyhow!("A token and user id are required"));
    }
    let user = CurrentUser {
        id: Some(user_id),
        name: None,
    };
    Ok(Credentials::new(&token, user).into_provider())
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

async fn send(engine: &ChatEngine, receiver: &str, course: i64, content: &str, wait: u64) -> Result<()> {
    let mut events = engine.events().subscribe_all();
    engine.connect();
    if let Some(stream) = engine.stream() {
        // Give the stream a moment; sends fall back to HTTP if it is not up yet
        stream
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
            .await;
    }

    let id = engine.submit(receiver, course, content, None).await?;
    println!("Queued {}", id);

    let outcome = tokio::time::timeout(Duration::from_secs(wait), async {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::MessageSent(e) if e.message.id == id && !e.optimistic => {
                    return Ok(e.message);
                }
                EngineEvent::MessageError(e) if e.message_id == id => match e.status {
                    MessageStatus::Retrying => println!(
                        "Attempt failed ({}), retry {} scheduled",
                        e.error.unwrap_or_default(),
                        e.retry_count
                    ),
                    MessageStatus::Failed => {
                        return Err(anyhow!(
                            "Message failed after {} retries: {}",
                            e.retry_count,
                            e.error.unwrap_or_default()
                        ))
                    }
                    _ => debug!("Message {} back to {:?}", id, e.status),
                },
                _ => {}
            }
        }
        Err(anyhow!("Event stream closed"))
    })
    .await;

    match outcome {
        Ok(Ok(message)) => {
            println!(
                "Sent {} (server timestamp {})",
                message.id,
                message.server_timestamp.unwrap_or_default()
            );
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow!("No final outcome for {} within {}s", id, wait)),
    }
}

async fn listen(engine: &ChatEngine) -> Result<()> {
    if engine.stream().is_none() {
        return Err(anyhow!("No stream_url configured, nothing to listen to"));
    }
    let mut events = engine.events().subscribe_all();
    engine.connect();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(EngineEvent::MessageReceived(m)) => println!(
                    "[{}] {}: {}",
                    m.course_id.unwrap_or_default(),
                    m.sender_name.clone().or(m.sender_id.clone()).unwrap_or_default(),
                    m.content
                ),
                Some(EngineEvent::ConnectionChanged(c)) => println!("-- {:?}: {}", c.state, c.detail),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    utils::setup_logging(args.log_file.as_deref(), level)?;
    info!("coursechat starting up");

    if let Some(path) = args.credentials.clone() {
        set_credentials_path_override(path);
    }

    if let Command::Login { token, user_id, name } = &args.command {
        let user = CurrentUser {
            id: Some(user_id.clone()),
            name: name.clone(),
        };
        save_credentials(&Credentials::new(token, user))?;
        println!("Credentials saved");
        return Ok(());
    }

    let config = load_config(args.config.as_ref())?;
    let engine = ChatEngine::new(config, Arc::new(credential_provider()?))?;

    let result = match args.command {
        Command::Login { .. } => Ok(()),
        Command::Send {
            receiver,
            course,
            content,
            wait,
        } => send(&engine, &receiver, course, &content, wait).await,
        Command::Resolve { identifier, course } => {
            let user = engine.resolve(&identifier, course).await?;
            println!("{} -> {} ({})", identifier, user.id, user.name);
            Ok(())
        }
        Command::Conversations { refresh } => {
            for conv in engine.load_conversations(refresh).await? {
                println!(
                    "{:>8}  {:<24} {}",
                    conv.other_user_id,
                    conv.other_user_name,
                    conv.course_title
                );
            }
            Ok(())
        }
        Command::History {
            other_user_id,
            course,
            keep_unread,
        } => {
            let messages = engine.load_messages(&other_user_id, course, false).await?;
            for m in &messages {
                let who = if m.is_from_current_user { "me" } else { other_user_id.as_str() };
                println!("{}: {}", who, m.content);
            }
            if !keep_unread {
                let unread: Vec<String> = messages
                    .iter()
                    .filter(|m| !m.is_read && !m.is_from_current_user)
                    .filter_map(|m| m.id.clone())
                    .collect();
                engine.mark_read(&unread).await;
            }
            Ok(())
        }
        Command::Listen => listen(&engine).await,
    };

    engine.shutdown().await;
    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}
