use autoclaw::heartbeat::spawn_heartbeat;
use autoclaw::reply::{InboundMessage, Outbound, ReplyEngine};
use autoclaw::session::{now_ms, SessionStore};
use common::config::load_config;
use common::logging::{init_logging, LogLevel, LoggingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

#[derive(Debug, thiserror::Error)]
#[error("autoclawd error: {message}")]
pub struct AutoclawdError {
    message: String,
}

impl AutoclawdError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    log_file: Option<PathBuf>,
    debug: bool,
}

impl CliArgs {
    fn parse() -> Result<Self, AutoclawdError> {
        let mut args = std::env::args().skip(1);
        let mut cli = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let Some(path) = args.next() else {
                        return Err(AutoclawdError::new("missing value for --config"));
                    };
                    cli.config = Some(PathBuf::from(path));
                }
                "--log-file" => {
                    let Some(path) = args.next() else {
                        return Err(AutoclawdError::new("missing value for --log-file"));
                    };
                    cli.log_file = Some(PathBuf::from(path));
                }
                "--debug" => cli.debug = true,
                _ => {
                    return Err(AutoclawdError::new(format!("unknown argument: {arg}")));
                }
            }
        }
        Ok(cli)
    }
}

#[tokio::main]
async fn main() -> Result<(), AutoclawdError> {
    let cli = CliArgs::parse()?;
    init_logging(LoggingConfig {
        level: if cli.debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        },
        log_file: cli.log_file.clone(),
    })
    .map_err(|err| AutoclawdError::new(format!("logging init failed: {err}")))?;

    let config = load_config(cli.config.as_deref())
        .map_err(|err| AutoclawdError::new(err.to_string()))?;
    let store_path = config
        .inbound
        .reply
        .session
        .store_path()
        .map_err(|err| AutoclawdError::new(err.to_string()))?;
    let sessions = SessionStore::load(store_path);
    let engine = Arc::new(ReplyEngine::new(config, sessions));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);

    let heartbeat_task = spawn_heartbeat(engine.clone(), outbound_tx.clone(), shutdown_rx.clone());
    let dispatcher_task = tokio::spawn(dispatch_loop(outbound_rx));
    let provider_task = tokio::spawn(stdin_provider(engine, outbound_tx, shutdown_rx));

    tokio::select! {
        result = provider_task => {
            let _ = shutdown_tx.send(true);
            if let Err(err) = result {
                tracing::error!("provider task failed: {err}");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            let _ = signal;
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
        }
    }

    let _ = heartbeat_task.await;
    let _ = dispatcher_task.await;
    Ok(())
}

/// Line-oriented dev provider: `<from> <body...>` on stdin, payloads on
/// stdout. Real transports live outside this repository and feed the same
/// engine API.
async fn stdin_provider(
    engine: Arc<ReplyEngine>,
    outbound: mpsc::Sender<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::error!("stdin read failed: {err}");
                break;
            }
        };
        let Some(message) = parse_line(&line) else {
            tracing::warn!("ignoring malformed input line (want `<from> <body>`)");
            continue;
        };

        let from = message.from.clone();
        let outcome = engine.reply(&message).await;
        tracing::debug!(
            "turn finished in {}ms (exit={:?} killed={})",
            outcome.meta.duration_ms,
            outcome.meta.exit_code,
            outcome.meta.killed
        );
        if outcome.payloads.is_empty() {
            continue;
        }
        if outbound
            .send(Outbound {
                to: from,
                payloads: outcome.payloads,
            })
            .await
            .is_err()
        {
            break;
        }
    }
}

fn parse_line(line: &str) -> Option<InboundMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (from, body) = trimmed.split_once(char::is_whitespace)?;
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    Some(InboundMessage {
        from: from.to_string(),
        to: "console".to_string(),
        body: body.to_string(),
        message_id: format!("console-{}", now_ms()),
        media_paths: Vec::new(),
        received_at_ms: now_ms(),
    })
}

async fn dispatch_loop(mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(bundle) = outbound.recv().await {
        for payload in bundle.payloads {
            if let Some(text) = &payload.text {
                println!("-> {}: {text}", bundle.to);
            }
            if let Some(url) = &payload.media_url {
                println!("-> {}: [media] {url}", bundle.to);
            }
            for url in &payload.media_urls {
                println!("-> {}: [media] {url}", bundle.to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_line;

    #[test]
    fn parses_sender_and_body() {
        let message = parse_line("+15551234567 hello there").unwrap();
        assert_eq!(message.from, "+15551234567");
        assert_eq!(message.body, "hello there");
    }

    #[test]
    fn rejects_lines_without_a_body() {
        assert!(parse_line("").is_none());
        assert!(parse_line("+1555").is_none());
        assert!(parse_line("+1555   ").is_none());
    }
}
