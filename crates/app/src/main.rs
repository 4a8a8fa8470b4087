mod settings;

use std::future::Future;
use std::sync::Arc;

use gencase_llm::{ProviderError, STOP_REASON_MAX_TOKENS, create_endpoint};
use gencase_session::{
    ChatSessionManager, GenerateOptions, PostRequest, Role, Session, SessionError, SessionEvent,
    SessionHandle,
};
use gencase_storage::{ChatId, Feedback, FeedbackRating, FeedbackUpdate, SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::broadcast;

use settings::{SettingsError, SettingsStore};

const DEFAULT_ROUTE: &str = "/chat";
const FAILED_TURN_DIAGNOSTIC: &str = "The assistant could not answer. Please try again.";
const HELP: &str = "commands: /continue /reset /good /bad /model <id> /models /system <text> \
/chats /history <chat-id> /rename <chat-id> <title> /delete <chat-id> /quit";

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to create inference endpoint on `{stage}`, {source}"))]
    Endpoint {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to open storage on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("session operation failed on `{stage}`, {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("failed to save settings on `{stage}`, {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("terminal i/o failed on `{stage}`, {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

type AppResult<T> = Result<T, AppError>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "gencase exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let route = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ROUTE.to_string());

    let store = SettingsStore::load();
    let settings = store.settings();
    tracing::info!(
        config_path = %store.config_path().display(),
        provider_id = %settings.provider.provider_id,
        model_id = %settings.default_model_id(),
        "settings loaded"
    );

    let endpoint = create_endpoint(settings.provider.to_provider_config()).context(EndpointSnafu {
        stage: "startup-create-endpoint",
    })?;
    let storage = SqliteStorage::open(&settings.database_location())
        .await
        .context(StorageSnafu {
            stage: "startup-open-storage",
        })?;

    let manager = ChatSessionManager::new(endpoint, Arc::new(storage))
        .with_catalog(settings.catalog())
        .with_default_model(settings.default_model_id())
        .with_flush_policy(settings.flush_policy());
    let handle = SessionHandle::for_route(manager, &route);

    let mut stdout = tokio::io::stdout();
    let mut events = handle.manager().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    say(&mut stdout, &format!("gencase [{}] {HELP}\n", handle.use_case())).await?;
    loop {
        say(&mut stdout, "> ").await?;
        let Some(line) = lines.next_line().await.context(TerminalSnafu {
            stage: "repl-read-line",
        })?
        else {
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
        let argument = argument.trim();

        match command {
            "/quit" => break,
            "/help" => say(&mut stdout, &format!("{HELP}\n")).await?,
            "/reset" => {
                handle.clear();
                say(&mut stdout, "conversation cleared\n").await?;
            }
            "/continue" => {
                let turn = handle.continue_generation(GenerateOptions::default());
                stream_turn(&handle, &mut events, &mut stdout, turn).await?;
            }
            "/good" | "/bad" => {
                let rating = if command == "/good" {
                    FeedbackRating::Good
                } else {
                    FeedbackRating::Bad
                };
                send_feedback(&handle, &mut stdout, rating).await?;
            }
            "/model" if !argument.is_empty() => {
                if handle.manager().catalog().get(argument).is_none() {
                    say(&mut stdout, &format!("unknown model '{argument}', see /models\n")).await?;
                } else {
                    handle.set_model_id(argument).context(SessionSnafu {
                        stage: "repl-set-model",
                    })?;
                    let mut updated = store.settings().as_ref().clone();
                    updated.default_model = argument.to_string();
                    store.update(updated).context(SettingsSnafu {
                        stage: "repl-save-default-model",
                    })?;
                    say(&mut stdout, &format!("model set to {argument}\n")).await?;
                }
            }
            "/models" => {
                let current = handle.get_model_id().unwrap_or_default();
                for model in handle.manager().catalog().models() {
                    let marker = if model.id == current { "*" } else { " " };
                    say(&mut stdout, &format!("{marker} {} ({})\n", model.id, model.name)).await?;
                }
            }
            "/system" if !argument.is_empty() => {
                handle
                    .update_system_context(argument)
                    .context(SessionSnafu {
                        stage: "repl-update-system-context",
                    })?;
                say(&mut stdout, "system prompt updated\n").await?;
            }
            "/chats" => {
                let chats = handle.manager().list_chats().await.context(SessionSnafu {
                    stage: "repl-list-chats",
                })?;
                for chat in chats {
                    let title = if chat.title.is_empty() {
                        "(untitled)"
                    } else {
                        chat.title.as_str()
                    };
                    say(&mut stdout, &format!("{} {title}\n", chat.id)).await?;
                }
            }
            "/history" | "/delete" | "/rename" if !argument.is_empty() => {
                let (raw_id, rest) = argument.split_once(' ').unwrap_or((argument, ""));
                let Ok(chat_id) = ChatId::parse(raw_id) else {
                    say(&mut stdout, &format!("'{raw_id}' is not a chat id\n")).await?;
                    continue;
                };
                chat_command(&handle, &mut stdout, command, chat_id, rest.trim()).await?;
            }
            _ if command.starts_with('/') => say(&mut stdout, &format!("{HELP}\n")).await?,
            _ => {
                let turn = handle.post_chat(PostRequest::new(line));
                stream_turn(&handle, &mut events, &mut stdout, turn).await?;
            }
        }
    }

    Ok(())
}

/// Prints deltas for this session while `turn` runs, then reports how it ended.
async fn stream_turn<F>(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<SessionEvent>,
    stdout: &mut Stdout,
    turn: F,
) -> AppResult<()>
where
    F: Future<Output = Result<Arc<Session>, SessionError>>,
{
    tokio::pin!(turn);
    let outcome = loop {
        tokio::select! {
            outcome = &mut turn => break outcome,
            event = events.recv() => {
                if let Ok(event) = event {
                    print_event(handle, stdout, event).await?;
                }
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(handle, stdout, event).await?;
    }
    say(stdout, "\n").await?;

    match outcome {
        Ok(session) if session.stop_reason == STOP_REASON_MAX_TOKENS => {
            say(stdout, "(answer was cut off, type /continue)\n").await
        }
        Ok(_) => Ok(()),
        Err(error) if error.is_configuration() => {
            say(stdout, &format!("{error}; pick one with /model\n")).await
        }
        Err(error) if error.is_rejection() => say(stdout, &format!("{error}\n")).await,
        Err(error) => {
            tracing::warn!(key = %handle.key(), error = %error, "turn failed");
            handle
                .recover_failed_turn(FAILED_TURN_DIAGNOSTIC)
                .context(SessionSnafu {
                    stage: "repl-recover-failed-turn",
                })?;
            say(stdout, &format!("{FAILED_TURN_DIAGNOSTIC}\n")).await
        }
    }
}

async fn print_event(handle: &SessionHandle, stdout: &mut Stdout, event: SessionEvent) -> AppResult<()> {
    match event {
        SessionEvent::Delta { key, text } if &key == handle.key() => say(stdout, &text).await,
        SessionEvent::TitleChanged { title, .. } => {
            tracing::info!(title = %title, "chat titled");
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn send_feedback(
    handle: &SessionHandle,
    stdout: &mut Stdout,
    rating: FeedbackRating,
) -> AppResult<()> {
    let Some(message_id) = handle
        .messages()
        .iter()
        .rev()
        .find(|message| message.role == Role::Assistant)
        .and_then(|message| message.message_id)
    else {
        return say(stdout, "no saved answer to rate yet\n").await;
    };

    handle
        .send_feedback(FeedbackUpdate {
            message_id,
            feedback: Feedback::new(rating),
        })
        .await
        .context(SessionSnafu {
            stage: "repl-send-feedback",
        })?;
    say(stdout, "thanks for the feedback\n").await
}

async fn chat_command(
    handle: &SessionHandle,
    stdout: &mut Stdout,
    command: &str,
    chat_id: ChatId,
    rest: &str,
) -> AppResult<()> {
    let manager = handle.manager();
    match command {
        "/history" => {
            let session = manager
                .load_history(handle.key(), handle.use_case(), chat_id)
                .await
                .context(SessionSnafu {
                    stage: "repl-load-history",
                })?;
            for message in session.visible_messages() {
                let speaker = match message.role {
                    Role::User => "you",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                say(stdout, &format!("{speaker}: {}\n", message.content)).await?;
            }
            Ok(())
        }
        "/rename" if !rest.is_empty() => {
            manager
                .rename_chat(chat_id, rest.to_string())
                .await
                .context(SessionSnafu {
                    stage: "repl-rename-chat",
                })?;
            say(stdout, "chat renamed\n").await
        }
        "/delete" => {
            manager.delete_chat(chat_id).await.context(SessionSnafu {
                stage: "repl-delete-chat",
            })?;
            say(stdout, "chat deleted\n").await
        }
        _ => say(stdout, &format!("{HELP}\n")).await,
    }
}

async fn say(stdout: &mut Stdout, text: &str) -> AppResult<()> {
    stdout.write_all(text.as_bytes()).await.context(TerminalSnafu {
        stage: "write-stdout",
    })?;
    stdout.flush().await.context(TerminalSnafu {
        stage: "flush-stdout",
    })
}
