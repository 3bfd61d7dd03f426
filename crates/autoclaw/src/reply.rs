use crate::agent::{self, AgentInvocation, AgentKind, AgentMeta};
use crate::chunker;
use crate::directive::{self, Directives, ThinkLevel, VerboseLevel};
use crate::media;
use crate::queue::CommandQueue;
use crate::runner;
use crate::session::{self, ResolvedSession, SessionStore};
use crate::template::{self, TemplateContext};
use crate::transcribe;
use chrono::Utc;
use common::config::{
    InboundConfig, RelayConfig, ReplyMode, SelfEchoRule, SessionConfig, TimestampPrefix,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const ABORT_NOTICE: &str = "Agent was aborted.";
pub const ABORT_REMINDER: &str = "[system: the user aborted your previous run; do not resume it]";
pub const NO_OUTPUT_NOTICE: &str = "(command produced no output)";
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";
pub const HEARTBEAT_BODY: &str = "HEARTBEAT /think:high";

const TIMEOUT_EXCERPT_CHARS: usize = 800;
const FAILURE_EXCERPT_CHARS: usize = 500;

/// One inbound message handed over by a provider. Immutable once received.
#[derive(Clone, Debug, Default)]
pub struct InboundMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    pub message_id: String,
    pub media_paths: Vec<String>,
    pub received_at_ms: u64,
}

/// One outbound unit for the dispatching provider.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplyPayload {
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub media_urls: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct CommandReplyMeta {
    pub duration_ms: u64,
    pub queued_ms: Option<u64>,
    pub queued_ahead: Option<usize>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub killed: bool,
    pub agent_meta: Option<AgentMeta>,
}

#[derive(Clone, Debug, Default)]
pub struct ReplyOutcome {
    pub payloads: Vec<ReplyPayload>,
    pub meta: CommandReplyMeta,
}

/// Outbound bundle routed back to a provider by the caller.
#[derive(Clone, Debug)]
pub struct Outbound {
    pub to: String,
    pub payloads: Vec<ReplyPayload>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TurnKind {
    User,
    Heartbeat,
}

/// The auto-reply orchestrator.
///
/// Owns the session store and the global command queue; never returns an
/// error across this boundary. Every failure becomes a user-visible payload
/// or a log line.
pub struct ReplyEngine {
    inbound: InboundConfig,
    sessions: SessionStore,
    queue: CommandQueue,
    chunk_limit: usize,
    typing: Option<mpsc::Sender<String>>,
    last_outbound: Mutex<HashMap<String, Vec<String>>>,
}

impl ReplyEngine {
    pub fn new(config: RelayConfig, sessions: SessionStore) -> Self {
        Self {
            inbound: config.inbound,
            sessions,
            queue: CommandQueue::new(),
            chunk_limit: chunker::TELEPHONY_CHUNK_LIMIT,
            typing: None,
            last_outbound: Mutex::new(HashMap::new()),
        }
    }

    /// Provider-specific outbound size cap.
    pub fn with_chunk_limit(mut self, limit: usize) -> Self {
        self.chunk_limit = limit;
        self
    }

    /// Receives the recipient each typing interval while a command runs.
    pub fn with_typing_notifier(mut self, notifier: mpsc::Sender<String>) -> Self {
        self.typing = Some(notifier);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn heartbeat_minutes(&self) -> Option<u64> {
        self.inbound.reply.heartbeat_minutes.filter(|minutes| *minutes > 0)
    }

    pub fn heartbeat_idle_minutes(&self) -> u64 {
        let session = &self.inbound.reply.session;
        session
            .heartbeat_idle_minutes
            .unwrap_or(session.idle_minutes)
    }

    pub async fn reply(&self, message: &InboundMessage) -> ReplyOutcome {
        self.reply_turn(message, TurnKind::User).await
    }

    /// Heartbeat variant: no admission, no `touch`, queue backpressure, and
    /// `HEARTBEAT_OK` suppression. `message.from` is the session key.
    pub async fn reply_heartbeat(&self, message: &InboundMessage) -> ReplyOutcome {
        self.reply_turn(message, TurnKind::Heartbeat).await
    }

    async fn reply_turn(&self, message: &InboundMessage, turn: TurnKind) -> ReplyOutcome {
        let started = Instant::now();
        let mut outcome = ReplyOutcome::default();
        let reply_cfg = &self.inbound.reply;
        let session_cfg = &reply_cfg.session;

        match turn {
            TurnKind::User => {
                if !self.inbound.allows(&message.from) {
                    tracing::debug!("admission refused for {}", message.from);
                    return outcome;
                }
                if self.is_echo(&message.from, &message.body).await {
                    tracing::debug!("suppressed self-echo from {}", message.from);
                    return outcome;
                }
            }
            TurnKind::Heartbeat => {
                if self.queue.pending() > 0 {
                    tracing::debug!("heartbeat for {} skipped: queue busy", message.from);
                    return outcome;
                }
            }
        }

        let mut body = message.body.clone();
        let mut template_media_path = message.media_paths.first().cloned();
        if turn == TurnKind::User {
            if let Some(transcribe_cfg) = &self.inbound.transcribe_audio {
                let audio = message
                    .media_paths
                    .iter()
                    .find(|path| transcribe::is_audio_path(path));
                if let Some(audio) = audio {
                    if let Some(transcript) = transcribe::transcribe(transcribe_cfg, audio).await {
                        body = transcript;
                        template_media_path = Some(audio.clone());
                    }
                }
            }
        }

        let directives = directive::parse_directives(&body, &session_cfg.reset_triggers);
        let key = match turn {
            TurnKind::User => session::session_key(session_cfg.scope, &message.from),
            TurnKind::Heartbeat => message.from.clone(),
        };

        if directives.abort_requested {
            self.sessions
                .resolve(&key, false, session_cfg.idle_minutes)
                .await;
            self.sessions.set_abort_pending(&key, true).await;
            self.sessions.touch(&key).await;
            outcome.payloads = self
                .finish_payloads(vec![text_payload(ABORT_NOTICE)], &message.from, turn)
                .await;
            outcome.meta.duration_ms = started.elapsed().as_millis() as u64;
            return outcome;
        }

        if directives.directive_only {
            let acks = self.apply_directive_only(&key, &directives, session_cfg).await;
            outcome.payloads = self.finish_payloads(acks, &message.from, turn).await;
            outcome.meta.duration_ms = started.elapsed().as_millis() as u64;
            return outcome;
        }

        if directives.stripped_body.is_empty() {
            tracing::debug!("empty body from {}, nothing to do", message.from);
            return outcome;
        }

        let resolved = match turn {
            TurnKind::User => {
                let resolved = self
                    .sessions
                    .resolve(&key, directives.reset_requested, session_cfg.idle_minutes)
                    .await;
                self.sessions.touch(&key).await;
                resolved
            }
            TurnKind::Heartbeat => match self.sessions.snapshot(&key).await {
                Some(existing) => ResolvedSession {
                    is_first_turn: !existing.system_sent,
                    is_new: false,
                    session: existing,
                },
                None => return outcome,
            },
        };
        let current = resolved.session.clone();

        // Prompt composition, innermost to outermost.
        let mut prompt = directives.stripped_body.clone();
        if let Some(prefix) = &reply_cfg.body_prefix {
            prompt = format!("{prefix}{prompt}");
        }
        if let Some(prefix) = &self.inbound.message_prefix {
            prompt = format!("{prefix}{prompt}");
        }
        if let Some(stamp) = timestamp_prefix_text(&self.inbound.timestamp_prefix) {
            prompt = format!("{stamp}{prompt}");
        }
        if turn == TurnKind::User && current.abort_pending {
            prompt = format!("{ABORT_REMINDER}\n{prompt}");
            self.sessions.set_abort_pending(&key, false).await;
        }

        let system_due = resolved.is_first_turn || !session_cfg.send_system_once;
        if system_due {
            if let Some(template_text) = &reply_cfg.template {
                let ctx = self.template_ctx(message, &directives, &resolved, &prompt, &template_media_path);
                if template_text.contains("{{Body}}") {
                    prompt = template::apply(template_text, &ctx);
                } else {
                    prompt = format!("{}\n\n{prompt}", template::apply(template_text, &ctx));
                }
            }
            if let Some(intro) = &session_cfg.session_intro {
                prompt = format!("{intro}\n\n{prompt}");
            }
        }

        let effective_think = directives
            .think
            .or(current.think_default)
            .or_else(|| reply_cfg.thinking_default.as_deref().and_then(ThinkLevel::parse))
            .unwrap_or(ThinkLevel::Off);
        let effective_verbose = directives
            .verbose
            .or(current.verbose_default)
            .or_else(|| {
                reply_cfg
                    .verbose_default
                    .as_deref()
                    .and_then(VerboseLevel::parse)
            })
            .unwrap_or(VerboseLevel::Off);

        if reply_cfg.mode == ReplyMode::Text {
            let Some(text) = &reply_cfg.text else {
                return outcome;
            };
            let ctx = self.template_ctx(message, &directives, &resolved, &prompt, &template_media_path);
            let rendered = template::apply(text, &ctx);
            let mut payloads = self.chunked_payloads(&rendered, Vec::new());
            attach_media_url(&mut payloads, reply_cfg.media_url.as_deref());
            outcome.payloads = self.finish_payloads(payloads, &message.from, turn).await;
            outcome.meta.duration_ms = started.elapsed().as_millis() as u64;
            return outcome;
        }

        // Command mode.
        let command_template = match turn {
            TurnKind::Heartbeat => reply_cfg
                .heartbeat_command
                .as_ref()
                .unwrap_or(&reply_cfg.command),
            TurnKind::User => &reply_cfg.command,
        };
        if command_template.is_empty() {
            tracing::debug!("no reply command configured");
            return outcome;
        }

        let kind = reply_cfg
            .agent
            .kind
            .as_deref()
            .and_then(AgentKind::parse)
            .or_else(|| AgentKind::detect(command_template));

        if effective_think != ThinkLevel::Off && kind != Some(AgentKind::Pi) {
            if let Some(cue) = effective_think.cue_word() {
                prompt = format!("{prompt}\n\n{cue}");
            }
        }

        let ctx = self.template_ctx(message, &directives, &resolved, &prompt, &template_media_path);
        let mut argv = Vec::with_capacity(command_template.len() + 6);
        let mut body_index = None;
        for (index, arg) in command_template.iter().enumerate() {
            if body_index.is_none() && arg.contains("{{Body}}") {
                body_index = Some(index);
            }
            argv.push(template::apply(arg, &ctx));
        }
        let body_index = match body_index {
            Some(index) => index,
            None => {
                argv.push(prompt.clone());
                argv.len() - 1
            }
        };

        if let Some(kind) = kind {
            // The agent CLI has only seen the session id once a turn has
            // completed; create-vs-resume keys on that, not on whether the
            // session record itself was freshly minted.
            let invocation = AgentInvocation {
                session_id: current.id.clone(),
                is_new_session: resolved.is_first_turn,
                args_template: session_cfg.args_template.clone(),
                session_arg_before_body: session_cfg.session_arg_before_body,
                format: reply_cfg.agent.format.clone(),
                think: effective_think,
                identity_prefix: reply_cfg.agent.identity_prefix.clone(),
                send_system_once: session_cfg.send_system_once,
                system_sent: current.system_sent,
            };
            let (shaped, _) = agent::build_args(kind, argv, body_index, &invocation);
            argv = shaped;
        }

        let timeout = Duration::from_secs_f64(reply_cfg.timeout_seconds.max(0.0));
        let cwd = reply_cfg.cwd.clone();
        let mut queued: Option<(u64, usize)> = None;
        let _typing = self.start_typing(turn, &message.from);
        let run_result = self
            .queue
            .enqueue(
                || async { runner::run_command(&argv, cwd.as_deref(), timeout).await },
                |wait_ms, ahead| {
                    queued = Some((wait_ms, ahead));
                },
            )
            .await;

        outcome.meta.duration_ms = started.elapsed().as_millis() as u64;
        if let Some((wait_ms, ahead)) = queued {
            outcome.meta.queued_ms = Some(wait_ms);
            outcome.meta.queued_ahead = Some(ahead);
        }

        let output = match run_result {
            Ok(output) => output,
            Err(err) => {
                tracing::error!("agent command failed to start: {err}");
                outcome.payloads = self
                    .finish_payloads(
                        vec![text_payload(&format!("Command failed: {err}"))],
                        &message.from,
                        turn,
                    )
                    .await;
                return outcome;
            }
        };
        outcome.meta.exit_code = output.exit_code;
        outcome.meta.signal = output.signal;
        outcome.meta.killed = output.killed;
        if !output.stderr.trim().is_empty() {
            tracing::debug!("agent stderr: {}", truncate_chars(output.stderr.trim(), 2_000));
        }

        if output.killed {
            let mut text = format!(
                "Command timed out after {}s.",
                format_seconds(reply_cfg.timeout_seconds)
            );
            let partial = output.stdout.trim();
            if !partial.is_empty() {
                text = format!(
                    "{text}\n\nPartial output:\n{}",
                    truncate_chars(partial, TIMEOUT_EXCERPT_CHARS)
                );
            }
            outcome.payloads = self
                .finish_payloads(vec![text_payload(&text)], &message.from, turn)
                .await;
            return outcome;
        }

        if output.exit_code != Some(0) {
            let mut text = match (output.exit_code, output.signal) {
                (Some(code), Some(signal)) => {
                    format!("Command failed (exit {code}, signal {signal}).")
                }
                (Some(code), None) => format!("Command failed (exit {code})."),
                (None, Some(signal)) => format!("Command failed (signal {signal})."),
                (None, None) => "Command failed.".to_string(),
            };
            let excerpt = if output.stdout.trim().is_empty() {
                output.stderr.trim()
            } else {
                output.stdout.trim()
            };
            if !excerpt.is_empty() {
                text = format!(
                    "{text}\n\n{}",
                    truncate_chars(excerpt, FAILURE_EXCERPT_CHARS)
                );
            }
            outcome.payloads = self
                .finish_payloads(vec![text_payload(&text)], &message.from, turn)
                .await;
            return outcome;
        }

        let parsed = match kind {
            Some(kind) => agent::parse_output(kind, &output.stdout),
            None => agent::parse_plain(&output.stdout),
        };
        outcome.meta.agent_meta = Some(parsed.meta.clone());

        let mut texts = parsed.texts;
        if texts.is_empty() && parsed.tool_results.is_empty() {
            let raw = output.stdout.trim();
            if !raw.is_empty() {
                texts.push(raw.to_string());
            }
        }

        if turn == TurnKind::Heartbeat && texts.join("\n").trim() == HEARTBEAT_OK {
            tracing::info!("heartbeat ok for {key}");
            if resolved.is_first_turn {
                self.sessions.set_system_sent(&key).await;
            }
            return outcome;
        }

        let mut payloads = Vec::new();
        for text in texts {
            let split = media::split_media(&text);
            let media_urls =
                media::filter_media_by_size(split.media_urls, reply_cfg.media_max_mb).await;
            if split.text.is_empty() {
                if !media_urls.is_empty() {
                    payloads.push(ReplyPayload {
                        media_urls,
                        ..ReplyPayload::default()
                    });
                }
                continue;
            }
            payloads.extend(self.chunked_payloads(&split.text, media_urls));
        }
        if effective_verbose == VerboseLevel::On {
            for tool_result in parsed.tool_results {
                payloads.push(text_payload(&truncate_chars(
                    &tool_result,
                    self.chunk_limit,
                )));
            }
        }
        if payloads.is_empty() {
            payloads.push(text_payload(NO_OUTPUT_NOTICE));
        }
        attach_media_url(&mut payloads, reply_cfg.media_url.as_deref());

        if resolved.is_first_turn {
            self.sessions.set_system_sent(&key).await;
        }

        outcome.payloads = self.finish_payloads(payloads, &message.from, turn).await;
        outcome
    }

    async fn apply_directive_only(
        &self,
        key: &str,
        directives: &Directives,
        session_cfg: &SessionConfig,
    ) -> Vec<ReplyPayload> {
        if let Some(bad) = directives.invalid.first() {
            return vec![text_payload(&format!(
                "Unknown directive value {bad:?}. Use /think off|minimal|low|medium|high or /verbose on|off."
            ))];
        }

        self.sessions
            .resolve(key, directives.reset_requested, session_cfg.idle_minutes)
            .await;
        self.sessions.touch(key).await;

        let mut acks = Vec::new();
        if directives.reset_requested && directives.think.is_none() && directives.verbose.is_none()
        {
            acks.push(text_payload("Started a new session."));
        }
        if let Some(level) = directives.think {
            self.sessions.set_think_default(key, level).await;
            acks.push(match level {
                ThinkLevel::Off => text_payload("Thinking disabled."),
                other => text_payload(&format!("Thinking level set to {}.", other.as_str())),
            });
        }
        if let Some(level) = directives.verbose {
            self.sessions.set_verbose_default(key, level).await;
            acks.push(match level {
                VerboseLevel::On => text_payload("Verbose logging enabled."),
                VerboseLevel::Off => text_payload("Verbose logging disabled."),
            });
        }
        acks
    }

    fn template_ctx(
        &self,
        message: &InboundMessage,
        directives: &Directives,
        resolved: &ResolvedSession,
        prompt: &str,
        media_path: &Option<String>,
    ) -> TemplateContext {
        TemplateContext {
            body: prompt.to_string(),
            body_stripped: directives.stripped_body.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
            message_sid: message.message_id.clone(),
            session_id: resolved.session.id.clone(),
            is_new_session: resolved.is_new,
            media_path: media_path.clone(),
        }
    }

    fn chunked_payloads(&self, text: &str, media_urls: Vec<String>) -> Vec<ReplyPayload> {
        let mut media_urls = Some(media_urls);
        chunker::chunk_text(text, self.chunk_limit)
            .into_iter()
            .map(|chunk| ReplyPayload {
                text: Some(chunk),
                media_url: None,
                media_urls: media_urls.take().unwrap_or_default(),
            })
            .collect()
    }

    async fn finish_payloads(
        &self,
        mut payloads: Vec<ReplyPayload>,
        from: &str,
        turn: TurnKind,
    ) -> Vec<ReplyPayload> {
        if let Some(prefix) = &self.inbound.response_prefix {
            for payload in &mut payloads {
                if let Some(text) = &mut payload.text {
                    *text = format!("{prefix}{text}");
                }
            }
        }
        if turn == TurnKind::User && self.inbound.self_echo_rule != SelfEchoRule::Off {
            let texts: Vec<String> = payloads
                .iter()
                .filter_map(|payload| payload.text.clone())
                .collect();
            if !texts.is_empty() {
                self.last_outbound
                    .lock()
                    .await
                    .insert(from.to_string(), texts);
            }
        }
        payloads
    }

    async fn is_echo(&self, from: &str, body: &str) -> bool {
        let rule = self.inbound.self_echo_rule;
        if rule == SelfEchoRule::Off {
            return false;
        }
        let guard = self.last_outbound.lock().await;
        let Some(last) = guard.get(from) else {
            return false;
        };
        let triggers = &self.inbound.reply.session.reset_triggers;
        match rule {
            SelfEchoRule::Off => false,
            SelfEchoRule::Raw => last.iter().any(|text| text == body),
            SelfEchoRule::Stripped => {
                let stripped = directive::parse_directives(body, triggers).stripped_body;
                last.iter().any(|text| {
                    directive::parse_directives(text, triggers).stripped_body == stripped
                })
            }
            SelfEchoRule::Prefixed => match &self.inbound.response_prefix {
                Some(prefix) => {
                    body.starts_with(prefix.as_str()) && last.iter().any(|text| text == body)
                }
                None => last.iter().any(|text| text == body),
            },
        }
    }

    fn start_typing(&self, turn: TurnKind, to: &str) -> Option<TypingGuard> {
        if turn != TurnKind::User {
            return None;
        }
        let interval = self.inbound.reply.typing_interval_seconds.filter(|s| *s > 0)?;
        let notifier = self.typing.clone()?;
        let to = to.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;
                if notifier.send(to.clone()).await.is_err() {
                    break;
                }
            }
        });
        Some(TypingGuard { handle })
    }
}

struct TypingGuard {
    handle: JoinHandle<()>,
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn text_payload(text: &str) -> ReplyPayload {
    ReplyPayload {
        text: Some(text.to_string()),
        media_url: None,
        media_urls: Vec::new(),
    }
}

fn attach_media_url(payloads: &mut [ReplyPayload], media_url: Option<&str>) {
    if let (Some(url), Some(first)) = (media_url, payloads.first_mut()) {
        first.media_url = Some(url.to_string());
    }
}

fn timestamp_prefix_text(prefix: &TimestampPrefix) -> Option<String> {
    let now = Utc::now();
    match prefix {
        TimestampPrefix::Off => None,
        TimestampPrefix::Utc => Some(format!("[{}] ", now.format("%Y-%m-%d %H:%M UTC"))),
        TimestampPrefix::Zone(zone) => match zone.parse::<chrono_tz::Tz>() {
            Ok(tz) => Some(format!(
                "[{}] ",
                now.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z")
            )),
            Err(_) => {
                tracing::warn!("unknown timezone {zone:?}, using UTC");
                Some(format!("[{}] ", now.format("%Y-%m-%d %H:%M UTC")))
            }
        },
    }
}

/// Cap `text` at `limit` chars; the ellipsis marker counts against the cap.
fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn format_seconds(seconds: f64) -> String {
    format!("{seconds}")
}
