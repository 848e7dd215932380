use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::path::PathBuf;

use cs_backend::DecodeMode;
use cs_core::config::TransportKind;
use cs_core::{Chat, ChatEvent, Config, SessionOutcome, SessionState};
use cs_protocol::Role;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("chatstream: stream answers from a chat backend");
    println!();
    println!("Usage:");
    println!("  chatstream                     Interactive mode, one question per line");
    println!("  chatstream \"question\"          Ask once and print the answer");
    println!("  echo \"question\" | chatstream   Ask once, question read from stdin");
    println!();
    println!("Options:");
    println!("  --url <URL>        Chat endpoint (overrides config)");
    println!("  --lines            Expect `data: ` framed lines ending in [DONE]");
    println!("  --raw              Expect plain text chunks");
    println!("  --json             Expect one JSON document");
    println!("  --event-source     Read server-sent events through an event source");
    println!("  --session <ID>     Client session id sent with each request");
    println!("  --config <PATH>    Config file (default: $XDG_CONFIG_HOME/chatstream/config.toml)");
    println!("  --version          Print version");
    println!("  --help             Print this help");
    println!("  --                 End of options; the rest is the question");
    println!();
    println!("Interactive commands: /clear, /quit. Ctrl-C cancels the current answer.");
}

#[derive(Debug, Default, PartialEq)]
struct Args {
    url: Option<String>,
    decode: Option<DecodeMode>,
    event_source: bool,
    session: Option<String>,
    config: Option<PathBuf>,
    question: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if arg == "--" {
            let rest: Vec<String> = args.by_ref().collect();
            if rest.is_empty() {
                break;
            }
            if parsed.question.is_some() || rest.len() > 1 {
                return Err("expected a single question; quote it".to_string());
            }
            parsed.question = rest.into_iter().next();
            break;
        }
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--url" => parsed.url = Some(value("--url")?),
            "--session" => parsed.session = Some(value("--session")?),
            "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--lines" => parsed.decode = Some(DecodeMode::Lines),
            "--raw" => parsed.decode = Some(DecodeMode::Raw),
            "--json" => parsed.decode = Some(DecodeMode::Document),
            "--event-source" => parsed.event_source = true,
            flag if flag.starts_with('-') => return Err(format!("unknown option: {flag}")),
            _ if parsed.question.is_some() => {
                return Err("expected a single question; quote it".to_string())
            }
            question => parsed.question = Some(question.to_string()),
        }
    }
    Ok(parsed)
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(ref url) = self.url {
            config.backend.url = url.clone();
        }
        if self.decode.is_some() {
            config.backend.decode = self.decode;
        }
        if self.event_source {
            config.backend.transport = TransportKind::EventSource;
        }
        if let Some(ref id) = self.session {
            config.session.id = Some(id.clone());
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let options = raw.iter().take_while(|a| *a != "--");

    if options.clone().any(|a| a == "--help" || a == "-h") {
        print_help();
        return;
    }

    if options.clone().any(|a| a == "--version" || a == "-V") {
        println!("chatstream {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    init_tracing();

    let args = match parse_args(raw) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("hint: chatstream --help");
            std::process::exit(2);
        }
    };

    let mut config = match args.config {
        Some(ref path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        None => Config::load_or_default(),
    };
    args.apply(&mut config);

    let mut chat = match Chat::from_config(&config) {
        Ok(chat) => chat,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    // One-shot mode: positional question or piped stdin
    let stdin_is_pipe = !io::stdin().is_terminal();
    let question = if let Some(ref q) = args.question {
        Some(q.clone())
    } else if stdin_is_pipe {
        let mut buf = String::new();
        if io::stdin().read_to_string(&mut buf).is_ok() && !buf.trim().is_empty() {
            Some(buf.trim().to_string())
        } else {
            None
        }
    } else {
        None
    };

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Some(question) = question {
        let outcome = runtime.block_on(exchange(&mut chat, question));
        std::process::exit(exit_code(&outcome));
    }

    if stdin_is_pipe {
        eprintln!("error: no question given");
        std::process::exit(2);
    }

    run_interactive(&mut chat, &runtime);
}

fn run_interactive(chat: &mut Chat, runtime: &Runtime) {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("> ");
        let _ = io::stderr().flush();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                eprintln!("error: {e}");
                break;
            }
            None => break,
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                chat.clear();
                eprintln!("[transcript cleared]");
            }
            text => {
                runtime.block_on(exchange(chat, text.to_string()));
            }
        }
    }
}

/// Run one exchange, printing the answer as it streams. Ctrl-C cancels it.
async fn exchange(chat: &mut Chat, text: String) -> SessionOutcome {
    let mut events = chat.subscribe();
    let session = chat.start(text);
    let handle = session.handle();
    debug!(session = %session.id(), "streaming answer");

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(session = %handle.id(), "interrupted; cancelling");
            handle.cancel();
        }
    });

    let (outcome, ()) = tokio::join!(chat.run(session), render(&mut events));
    interrupt.abort();
    outcome
}

/// Print assistant text as it grows, until the session reaches a terminal
/// state.
async fn render(events: &mut UnboundedReceiver<ChatEvent>) {
    let mut stdout = io::stdout();
    let mut shown = String::new();

    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Transcript(messages) => {
                let Some(last) = messages.last().filter(|m| m.role == Role::Assistant) else {
                    continue;
                };
                match last.text.strip_prefix(shown.as_str()) {
                    Some(added) => {
                        let _ = write!(stdout, "{added}");
                    }
                    // A whole-answer replacement: start over on a new line.
                    None => {
                        let _ = write!(stdout, "\n{}", last.text);
                    }
                }
                let _ = stdout.flush();
                shown.clone_from(&last.text);
            }
            ChatEvent::Failed { error, .. } => {
                if !shown.is_empty() {
                    let _ = writeln!(stdout);
                }
                eprintln!("error: {error}");
                shown.clear();
            }
            ChatEvent::State { state, .. } if state.is_terminal() => {
                if !shown.is_empty() {
                    let _ = writeln!(stdout);
                }
                if state == SessionState::Cancelled {
                    eprintln!("[cancelled]");
                }
                return;
            }
            ChatEvent::State { .. } => {}
        }
    }
}

fn exit_code(outcome: &SessionOutcome) -> i32 {
    match outcome.state {
        SessionState::Completed => 0,
        SessionState::Cancelled => 130,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, String> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_question_and_flags() {
        let parsed = args(&["--raw", "--url", "http://x/chat", "what is 6*7?"]).unwrap();
        assert_eq!(parsed.decode, Some(DecodeMode::Raw));
        assert_eq!(parsed.url.as_deref(), Some("http://x/chat"));
        assert_eq!(parsed.question.as_deref(), Some("what is 6*7?"));
    }

    #[test]
    fn last_decode_flag_wins() {
        let parsed = args(&["--raw", "--json"]).unwrap();
        assert_eq!(parsed.decode, Some(DecodeMode::Document));
    }

    #[test]
    fn missing_value_is_an_error() {
        assert_eq!(args(&["--url"]).unwrap_err(), "--url requires a value");
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(args(&["--verbose"]).is_err());
    }

    #[test]
    fn two_questions_is_an_error() {
        assert!(args(&["one", "two"]).is_err());
        assert!(args(&["one", "--", "two"]).is_err());
        assert!(args(&["--", "one", "two"]).is_err());
    }

    #[test]
    fn double_dash_ends_options() {
        let parsed = args(&["--raw", "--", "-5 in binary?"]).unwrap();
        assert_eq!(parsed.decode, Some(DecodeMode::Raw));
        assert_eq!(parsed.question.as_deref(), Some("-5 in binary?"));

        let parsed = args(&["--", "--help"]).unwrap();
        assert_eq!(parsed.question.as_deref(), Some("--help"));

        assert_eq!(args(&["--"]).unwrap(), Args::default());
    }

    #[test]
    fn overrides_apply_to_config() {
        let parsed = args(&["--event-source", "--session", "abc"]).unwrap();
        let mut config = Config::default();
        parsed.apply(&mut config);
        assert_eq!(config.backend.transport, TransportKind::EventSource);
        assert_eq!(config.session.id.as_deref(), Some("abc"));
        assert_eq!(config.backend.decode, None);
    }

    #[test]
    fn exit_codes_follow_state() {
        let outcome = |state| SessionOutcome {
            id: cs_core::SessionId(1),
            state,
            answer: String::new(),
            error: None,
            malformed: 0,
        };
        assert_eq!(exit_code(&outcome(SessionState::Completed)), 0);
        assert_eq!(exit_code(&outcome(SessionState::Failed)), 1);
        assert_eq!(exit_code(&outcome(SessionState::Cancelled)), 130);
    }
}
