use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sitechat_llm::{ChatTransport, TransportError, WireFormat, create_transport};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::chat::{
    ChatSession, InitiatorError, Message, MessageStatus, NavigationTarget, SessionId,
    SessionInitiator, SessionSeed, Submit, SubmitIgnored, SubmitOutcome, TranscriptChange,
    decode_route_segment,
};
use crate::settings::{Settings, SettingsError, SettingsOverrides, SettingsStore};

const LANDING_TITLE: &str = "Chat with a Website";
const LANDING_HINT: &str = "Enter a URL to start chatting with any website";
const EMPTY_TRANSCRIPT_TITLE: &str = "Start your conversation";
const EMPTY_TRANSCRIPT_HINT: &str = "Ask anything about the website";
const CHAT_HELP: &str =
    "Type a message, /retry, /dismiss or /quit. Ctrl-C stops a reply, or quits at the prompt.";

#[derive(Debug, Parser)]
#[command(
    name = "sitechat",
    version,
    about = "Chat with an AI agent about a website"
)]
pub struct Cli {
    /// Website to chat about; prompted for when omitted.
    pub url: Option<String>,
    /// Reuse a session id instead of generating one.
    #[arg(long)]
    pub session_id: Option<String>,
    /// Streaming chat endpoint.
    #[arg(long)]
    pub endpoint: Option<String>,
    /// Transport kind: http, rig-openai or echo.
    #[arg(long)]
    pub transport: Option<String>,
    /// Response body encoding: text or data-stream.
    #[arg(long, value_parser = parse_wire_format)]
    pub wire_format: Option<WireFormat>,
    /// Settings file to use instead of the default location.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect or create the settings file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the settings file location.
    Path,
    /// Write default settings.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            transport: self.transport.clone(),
            endpoint: self.endpoint.clone(),
            wire_format: self.wire_format,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(SettingsStore::default_config_path)
    }
}

fn parse_wire_format(raw: &str) -> Result<WireFormat, String> {
    WireFormat::parse(raw).ok_or_else(|| format!("unknown wire format '{raw}'"))
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("transport setup failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("target url refused on `{stage}`: {source}"))]
    Initiator {
        stage: &'static str,
        source: InitiatorError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// One line typed inside the chat view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Message(String),
    Retry,
    Dismiss,
    Quit,
    Help,
}

impl ChatCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "/retry" => Self::Retry,
            "/dismiss" => Self::Dismiss,
            "/quit" | "/exit" => Self::Quit,
            "/help" => Self::Help,
            _ => Self::Message(line.to_string()),
        }
    }
}

type InputLines = Lines<BufReader<Stdin>>;

pub async fn run(cli: Cli) -> AppResult<()> {
    let store = SettingsStore::with_overrides(cli.config_path(), &cli.overrides());

    if let Some(Command::Config { action }) = &cli.command {
        return run_config(&store, action);
    }

    let settings = store.settings();
    let transport = create_transport(settings.to_transport_config()).context(TransportSnafu {
        stage: "create-transport",
    })?;
    tracing::info!(
        transport = transport.id(),
        endpoint = %settings.endpoint,
        wire_format = settings.wire_format.as_str(),
        "transport ready"
    );

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut initiator = SessionInitiator::new().with_transition_delay(settings.navigation_delay());

    let route = match &cli.url {
        Some(raw) => {
            initiator.set_input(raw.as_str());
            initiator
                .submit_and_navigate()
                .await
                .context(InitiatorSnafu {
                    stage: "accept-cli-url",
                })?
        }
        None => landing_prompt(&mut initiator, &mut input).await?,
    };
    let Some(route) = route else {
        return Ok(());
    };

    let target_url = decode_route_segment(&route.path).context(InitiatorSnafu {
        stage: "decode-chat-route",
    })?;
    let mut session = open_session(target_url, cli.session_id.clone(), transport);
    let result = chat_loop(&mut session, &mut input).await;
    session.close();
    result
}

fn run_config(store: &SettingsStore, action: &ConfigAction) -> AppResult<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", store.config_path().display());
        }
        ConfigAction::Init { force } => {
            if store.config_path().exists() && !force {
                println!(
                    "settings already exist at {} (use --force to overwrite)",
                    store.config_path().display()
                );
                return Ok(());
            }
            store.update(Settings::default()).context(SettingsSnafu {
                stage: "write-default-settings",
            })?;
            println!("wrote {}", store.config_path().display());
        }
    }
    Ok(())
}

/// Prompts until a valid URL is accepted. `None` when input ends first.
async fn landing_prompt(
    initiator: &mut SessionInitiator,
    input: &mut InputLines,
) -> AppResult<Option<NavigationTarget>> {
    println!("{LANDING_TITLE}");
    println!("{LANDING_HINT}");

    loop {
        prompt("url> ")?;
        let interrupt = tokio::signal::ctrl_c();
        let Some(line) = next_line_or_interrupt(input, interrupt, "read-landing-input").await?
        else {
            return Ok(None);
        };

        initiator.set_input(line);
        match initiator.submit_and_navigate().await {
            Ok(Some(target)) => return Ok(Some(target)),
            Ok(None) => {}
            Err(error) => {
                tracing::debug!(error = %error, "landing input refused");
                eprintln!("{error}");
            }
        }
    }
}

async fn chat_loop(session: &mut ChatSession, input: &mut InputLines) -> AppResult<()> {
    println!("{}", session.title());
    println!("{CHAT_HELP}");
    if session.transcript().is_empty() {
        println!("{EMPTY_TRANSCRIPT_TITLE}");
        println!("{EMPTY_TRANSCRIPT_HINT}");
    } else {
        for message in session.transcript().messages() {
            println!("{}", render_message(message));
        }
    }

    loop {
        prompt("> ")?;
        let interrupt = tokio::signal::ctrl_c();
        let Some(line) = next_line_or_interrupt(input, interrupt, "read-chat-input").await? else {
            return Ok(());
        };

        let outcome = match ChatCommand::parse(&line) {
            ChatCommand::Quit => return Ok(()),
            ChatCommand::Help => {
                println!("{CHAT_HELP}");
                continue;
            }
            ChatCommand::Dismiss => {
                if session.dismiss_error() {
                    println!("(error dismissed)");
                }
                continue;
            }
            ChatCommand::Retry => session.retry(),
            ChatCommand::Message(text) => session.submit(Submit::new(text)),
        };

        match outcome {
            SubmitOutcome::Accepted(_) => {
                stream_reply(session).await?;
                // Printed output already ends at the newest message.
                session.transcript_mut().scroll().apply_pending_scroll();
            }
            SubmitOutcome::Ignored(SubmitIgnored::EmptyInput) => {}
            SubmitOutcome::Ignored(reason) => println!("({})", describe_ignored(reason)),
        }
    }
}

/// Reads one line; an interrupt at the prompt ends input like EOF does.
async fn next_line_or_interrupt<R, F>(
    input: &mut Lines<R>,
    interrupt: F,
    stage: &'static str,
) -> AppResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
    F: Future,
{
    tokio::select! {
        line = input.next_line() => line.context(ReadInputSnafu { stage }),
        _ = interrupt => {
            println!();
            tracing::debug!(stage, "input interrupted");
            Ok(None)
        }
    }
}

enum StreamStep {
    Change(Option<TranscriptChange>),
    Interrupted,
}

/// Prints the reply as it streams. Ctrl-C stops the request, not the app.
async fn stream_reply(session: &mut ChatSession) -> AppResult<()> {
    let mut label_printed = false;

    // A request that failed to start is already settled in the transcript.
    if !session.is_loading() {
        print_stream_failure(session);
        return Ok(());
    }

    loop {
        let step = tokio::select! {
            change = session.pump() => StreamStep::Change(change),
            _ = tokio::signal::ctrl_c() => StreamStep::Interrupted,
        };

        match step {
            StreamStep::Change(Some(TranscriptChange::AssistantDelta { delta, .. })) => {
                if !label_printed {
                    print!("AI: ");
                    label_printed = true;
                }
                print!("{delta}");
                flush_stdout()?;
            }
            StreamStep::Change(Some(TranscriptChange::AssistantFinalized { .. })) => {
                if label_printed {
                    println!();
                }
                return Ok(());
            }
            StreamStep::Change(Some(TranscriptChange::StreamFailed { incomplete, .. })) => {
                if label_printed {
                    println!();
                }
                if incomplete.is_some() {
                    println!("(reply incomplete)");
                }
                print_stream_failure(session);
                return Ok(());
            }
            StreamStep::Change(None) => return Ok(()),
            StreamStep::Interrupted => {
                session.stop();
                if label_printed {
                    println!();
                }
                println!("(stopped)");
                return Ok(());
            }
        }
    }
}

fn print_stream_failure(session: &ChatSession) {
    if let Some(message) = session.transcript().error_message() {
        eprintln!("{message}");
        eprintln!("(/retry to send again, /dismiss to clear)");
    }
}

pub fn render_message(message: &Message) -> String {
    let mut line = format!("{}: {}", message.role.label(), message.content);
    if let MessageStatus::Incomplete(_) = message.status {
        line.push_str(" [incomplete]");
    }
    line
}

fn describe_ignored(reason: SubmitIgnored) -> &'static str {
    match reason {
        SubmitIgnored::EmptyInput => "nothing to send",
        SubmitIgnored::StreamInFlight => "a reply is still streaming",
        SubmitIgnored::SessionClosed => "session is closed",
        SubmitIgnored::NothingToRetry => "nothing to retry",
    }
}

fn prompt(text: &str) -> AppResult<()> {
    print!("{text}");
    flush_stdout()
}

fn flush_stdout() -> AppResult<()> {
    std::io::stdout().flush().context(WriteOutputSnafu {
        stage: "flush-stdout",
    })
}

/// Builds a session against `transport` for callers that already resolved
/// the target URL.
pub fn open_session(
    target_url: impl Into<String>,
    session_id: Option<String>,
    transport: Arc<dyn ChatTransport>,
) -> ChatSession {
    let session_id = session_id.map(SessionId::new).unwrap_or_else(SessionId::generate);
    ChatSession::open(SessionSeed::new(session_id, target_url), transport)
}

#[cfg(test)]
mod tests {
    use sitechat_llm::EchoTransport;

    use super::*;
    use crate::chat::{MessageId, Role};

    #[test]
    fn cli_accepts_url_and_overrides() {
        let cli = Cli::try_parse_from([
            "sitechat",
            "https://example.com",
            "--transport",
            "echo",
            "--wire-format",
            "data-stream",
            "--session-id",
            "abc",
        ])
        .unwrap();

        assert_eq!(cli.url.as_deref(), Some("https://example.com"));
        assert_eq!(cli.session_id.as_deref(), Some("abc"));
        let overrides = cli.overrides();
        assert_eq!(overrides.transport.as_deref(), Some("echo"));
        assert_eq!(overrides.wire_format, Some(WireFormat::DataStream));
        assert_eq!(overrides.endpoint, None);
    }

    #[test]
    fn cli_parses_config_subcommands() {
        let cli = Cli::try_parse_from(["sitechat", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Config {
                action: ConfigAction::Init { force: true }
            })
        ));
        assert!(cli.url.is_none());

        assert!(Cli::try_parse_from(["sitechat", "--wire-format", "xml"]).is_err());
    }

    #[test]
    fn chat_commands_are_recognized() {
        assert_eq!(ChatCommand::parse(" /retry "), ChatCommand::Retry);
        assert_eq!(ChatCommand::parse("/dismiss"), ChatCommand::Dismiss);
        assert_eq!(ChatCommand::parse("/quit"), ChatCommand::Quit);
        assert_eq!(
            ChatCommand::parse("what is /retry?"),
            ChatCommand::Message("what is /retry?".to_string())
        );
    }

    #[test]
    fn incomplete_replies_are_marked() {
        let message = Message::new(
            MessageId::new(2),
            Role::Assistant,
            "Half an ans",
            MessageStatus::Incomplete("stopped".to_string()),
        );
        assert_eq!(render_message(&message), "AI: Half an ans [incomplete]");
    }

    #[tokio::test]
    async fn interrupt_at_prompt_ends_input() {
        // The writer half stays open, so the reader never sees a line or EOF.
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();

        let line = next_line_or_interrupt(&mut lines, std::future::ready(()), "test-input")
            .await
            .unwrap();
        assert_eq!(line, None);
    }

    #[tokio::test]
    async fn lines_are_read_until_interrupted() {
        let input: &[u8] = b"https://example.com\n";
        let mut lines = BufReader::new(input).lines();

        let line = next_line_or_interrupt(&mut lines, std::future::pending::<()>(), "test-input")
            .await
            .unwrap();
        assert_eq!(line.as_deref(), Some("https://example.com"));
    }

    #[tokio::test]
    async fn opened_session_uses_given_id() {
        let session = open_session(
            "https://example.com",
            Some("fixed".to_string()),
            Arc::new(EchoTransport::new()),
        );
        assert_eq!(session.session_id().as_str(), "fixed");
        assert_eq!(session.title(), "Chat with https://example.com");
    }
}
