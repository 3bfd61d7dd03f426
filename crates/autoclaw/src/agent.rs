use crate::directive::ThinkLevel;
use serde_json::Value;
use std::path::Path;

/// The agent CLIs the relay knows how to drive.
///
/// Each kind is a stateless capability record: command-name matching,
/// argv shaping, and output parsing. No per-kind state is held anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentKind {
    Claude,
    Opencode,
    Pi,
    Codex,
    Gemini,
}

impl AgentKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "opencode" => Some(Self::Opencode),
            "pi" => Some(Self::Pi),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    fn command_bases(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["claude"],
            Self::Opencode => &["opencode"],
            Self::Pi => &["pi", "tau"],
            Self::Codex => &["codex"],
            Self::Gemini => &["gemini"],
        }
    }

    pub fn matches(self, argv: &[String]) -> bool {
        let Some(program) = argv.first() else {
            return false;
        };
        let base = Path::new(program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(program);
        self.command_bases().iter().any(|known| *known == base)
    }

    pub fn detect(argv: &[String]) -> Option<Self> {
        [
            Self::Claude,
            Self::Opencode,
            Self::Pi,
            Self::Codex,
            Self::Gemini,
        ]
        .into_iter()
        .find(|kind| kind.matches(argv))
    }
}

/// Everything `build_args` needs to shape one invocation.
#[derive(Clone, Debug, Default)]
pub struct AgentInvocation {
    pub session_id: String,
    pub is_new_session: bool,
    /// Custom session-flag fragment; overrides the kind defaults.
    pub args_template: Option<Vec<String>>,
    pub session_arg_before_body: bool,
    pub format: Option<String>,
    pub think: ThinkLevel,
    pub identity_prefix: Option<String>,
    pub send_system_once: bool,
    pub system_sent: bool,
}

/// Inject session, format, and thinking flags onto a templated argv.
///
/// `body_index` points at the argv element holding the prompt body; the
/// returned index tracks it through insertions.
pub fn build_args(
    kind: AgentKind,
    mut argv: Vec<String>,
    mut body_index: usize,
    invocation: &AgentInvocation,
) -> (Vec<String>, usize) {
    let mut flags = session_flags(kind, invocation);

    match kind {
        AgentKind::Claude => {
            if let Some(format) = invocation.format.as_deref() {
                if !has_flag(&argv, "--output-format") {
                    flags.push("--output-format".to_string());
                    flags.push(format.to_string());
                }
            }
        }
        AgentKind::Pi => {
            if !has_flag(&argv, "-p") {
                argv.insert(1, "-p".to_string());
                if body_index >= 1 {
                    body_index += 1;
                }
            }
            if invocation.format.as_deref() == Some("json") && !has_flag(&argv, "--mode") {
                flags.push("--mode".to_string());
                flags.push("json".to_string());
            }
            if invocation.think != ThinkLevel::Off {
                flags.push("--think".to_string());
                flags.push(invocation.think.as_str().to_string());
            }
        }
        _ => {}
    }

    if invocation.session_arg_before_body {
        let inserted = flags.len();
        for (offset, flag) in flags.into_iter().enumerate() {
            argv.insert(body_index + offset, flag);
        }
        body_index += inserted;
    } else {
        argv.extend(flags);
    }

    if kind == AgentKind::Pi {
        if let Some(prefix) = invocation.identity_prefix.as_deref() {
            if !(invocation.send_system_once && invocation.system_sent) {
                let body = argv[body_index].clone();
                argv[body_index] = format!("{prefix}\n\n{body}");
            }
        }
    }

    (argv, body_index)
}

fn session_flags(kind: AgentKind, invocation: &AgentInvocation) -> Vec<String> {
    if let Some(template) = &invocation.args_template {
        return template
            .iter()
            .map(|arg| {
                arg.replace("{{SessionId}}", &invocation.session_id).replace(
                    "{{IsNewSession}}",
                    if invocation.is_new_session {
                        "true"
                    } else {
                        "false"
                    },
                )
            })
            .collect();
    }

    let id = invocation.session_id.clone();
    match kind {
        AgentKind::Claude => {
            if invocation.is_new_session {
                vec!["--session-id".to_string(), id]
            } else {
                vec!["--resume".to_string(), id]
            }
        }
        AgentKind::Codex | AgentKind::Opencode | AgentKind::Pi => {
            vec!["--session".to_string(), id]
        }
        AgentKind::Gemini => {
            if invocation.is_new_session {
                Vec::new()
            } else {
                vec!["--resume".to_string(), id]
            }
        }
    }
}

fn has_flag(argv: &[String], flag: &str) -> bool {
    argv.iter().any(|arg| arg == flag)
}

#[derive(Clone, Debug, Default)]
pub struct AgentMeta {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Value>,
    pub extra: Option<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct AgentParseResult {
    pub texts: Vec<String>,
    pub tool_results: Vec<String>,
    pub meta: AgentMeta,
}

/// Parse raw agent stdout into reply texts, tool traces, and metadata.
///
/// Stream kinds read newline-delimited JSON; malformed lines are skipped.
/// Consecutive duplicate assistant texts collapse to one. Input that never
/// parses falls back to the raw text.
pub fn parse_output(kind: AgentKind, raw: &str) -> AgentParseResult {
    match kind {
        AgentKind::Claude => parse_claude_stream(raw),
        AgentKind::Pi => parse_pi_stream(raw),
        AgentKind::Codex => parse_codex_stream(raw),
        AgentKind::Opencode | AgentKind::Gemini => parse_plain(raw),
    }
}

/// Fallback for commands that match no known agent kind.
pub fn parse_plain(raw: &str) -> AgentParseResult {
    let trimmed = raw.trim();
    let mut result = AgentParseResult::default();
    if !trimmed.is_empty() {
        result.texts.push(trimmed.to_string());
    }
    result
}

fn parse_claude_stream(raw: &str) -> AgentParseResult {
    let mut result = AgentParseResult::default();
    let mut saw_json = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        saw_json = true;

        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let content = &event["message"]["content"];
                let text = collect_text_blocks(content);
                if !text.is_empty() {
                    push_deduped(&mut result.texts, text);
                }
                collect_tool_blocks(content, &mut result.tool_results);
            }
            Some("user") => {
                collect_tool_blocks(&event["message"]["content"], &mut result.tool_results);
            }
            Some("system") => {
                if let Some(model) = event.get("model").and_then(Value::as_str) {
                    result.meta.model = Some(model.to_string());
                }
            }
            Some("result") => {
                result.meta.usage = event.get("usage").cloned();
                if let Some(stop) = event.get("subtype").and_then(Value::as_str) {
                    result.meta.stop_reason = Some(stop.to_string());
                }
                if result.texts.is_empty() {
                    if let Some(text) = event.get("result").and_then(Value::as_str) {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            result.texts.push(trimmed.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if !saw_json {
        return parse_plain(raw);
    }
    result
}

fn parse_pi_stream(raw: &str) -> AgentParseResult {
    let mut result = AgentParseResult::default();
    let mut saw_json = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        saw_json = true;

        if event.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let role = event.get("role").and_then(Value::as_str).unwrap_or("");
        let text = collect_text_blocks(&event["content"]);
        if text.is_empty() {
            continue;
        }
        if role == "assistant" {
            push_deduped(&mut result.texts, text);
        } else if role.starts_with("tool") {
            result.tool_results.push(text);
        }
    }

    if !saw_json {
        return parse_plain(raw);
    }
    result
}

fn parse_codex_stream(raw: &str) -> AgentParseResult {
    let mut result = AgentParseResult::default();
    let mut saw_json = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        saw_json = true;

        let msg = &event["msg"];
        if msg.get("type").and_then(Value::as_str) == Some("agent_message") {
            if let Some(text) = msg.get("message").and_then(Value::as_str) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    push_deduped(&mut result.texts, trimmed.to_string());
                }
            }
        }
    }

    if !saw_json {
        return parse_plain(raw);
    }
    result
}

/// Text from a content value that is either a plain string or an array of
/// `{type: "text", text}` blocks.
fn collect_text_blocks(content: &Value) -> String {
    if let Some(text) = content.as_str() {
        return text.trim().to_string();
    }
    let Some(blocks) = content.as_array() else {
        return String::new();
    };
    let mut parts = Vec::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
        }
    }
    parts.join("\n")
}

fn collect_tool_blocks(content: &Value, tool_results: &mut Vec<String>) {
    let Some(blocks) = content.as_array() else {
        return;
    };
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                tool_results.push(format!("[tool_use] {name}"));
            }
            Some("tool_result") => {
                let text = collect_text_blocks(&block["content"]);
                if !text.is_empty() {
                    tool_results.push(format!("[tool_result] {text}"));
                }
            }
            _ => {}
        }
    }
}

fn push_deduped(texts: &mut Vec<String>, text: String) {
    if texts.last() != Some(&text) {
        texts.push(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matches_by_basename() {
        assert!(AgentKind::Claude.matches(&argv(&["/usr/local/bin/claude", "-p"])));
        assert!(AgentKind::Pi.matches(&argv(&["tau"])));
        assert!(!AgentKind::Claude.matches(&argv(&["claudette"])));
        assert_eq!(
            AgentKind::detect(&argv(&["/opt/bin/codex", "exec"])),
            Some(AgentKind::Codex)
        );
        assert_eq!(AgentKind::detect(&argv(&["vim"])), None);
    }

    fn invocation(new: bool) -> AgentInvocation {
        AgentInvocation {
            session_id: "abc".to_string(),
            is_new_session: new,
            session_arg_before_body: true,
            send_system_once: true,
            ..AgentInvocation::default()
        }
    }

    #[test]
    fn claude_new_session_gets_session_id_flag() {
        let (out, body) = build_args(
            AgentKind::Claude,
            argv(&["claude", "-p", "hello"]),
            2,
            &invocation(true),
        );
        assert_eq!(out, argv(&["claude", "-p", "--session-id", "abc", "hello"]));
        assert_eq!(out[body], "hello");
    }

    #[test]
    fn claude_resume_uses_resume_flag() {
        let (out, _) = build_args(
            AgentKind::Claude,
            argv(&["claude", "-p", "hello"]),
            2,
            &invocation(false),
        );
        assert_eq!(out, argv(&["claude", "-p", "--resume", "abc", "hello"]));
    }

    #[test]
    fn claude_format_flag_added_once() {
        let mut inv = invocation(true);
        inv.format = Some("json".to_string());
        let (out, _) = build_args(AgentKind::Claude, argv(&["claude", "hi"]), 1, &inv);
        assert!(out.windows(2).any(|w| w[0] == "--output-format" && w[1] == "json"));

        let (already, _) = build_args(
            AgentKind::Claude,
            argv(&["claude", "--output-format", "text", "hi"]),
            3,
            &inv,
        );
        assert_eq!(
            already
                .iter()
                .filter(|arg| arg.as_str() == "--output-format")
                .count(),
            1
        );
    }

    #[test]
    fn gemini_only_resumes() {
        let (new, _) = build_args(AgentKind::Gemini, argv(&["gemini", "hi"]), 1, &invocation(true));
        assert_eq!(new, argv(&["gemini", "hi"]));
        let (resume, _) = build_args(
            AgentKind::Gemini,
            argv(&["gemini", "hi"]),
            1,
            &invocation(false),
        );
        assert_eq!(resume, argv(&["gemini", "--resume", "abc", "hi"]));
    }

    #[test]
    fn codex_and_opencode_always_pass_session() {
        for kind in [AgentKind::Codex, AgentKind::Opencode] {
            for new in [true, false] {
                let (out, _) = build_args(kind, argv(&["codex", "hi"]), 1, &invocation(new));
                assert!(out.windows(2).any(|w| w[0] == "--session" && w[1] == "abc"));
            }
        }
    }

    #[test]
    fn session_flags_append_when_configured() {
        let mut inv = invocation(false);
        inv.session_arg_before_body = false;
        let (out, body) = build_args(AgentKind::Claude, argv(&["claude", "hi"]), 1, &inv);
        assert_eq!(out, argv(&["claude", "hi", "--resume", "abc"]));
        assert_eq!(out[body], "hi");
    }

    #[test]
    fn custom_args_template_wins() {
        let mut inv = invocation(true);
        inv.args_template = Some(argv(&["--thread", "{{SessionId}}", "--fresh", "{{IsNewSession}}"]));
        let (out, _) = build_args(AgentKind::Claude, argv(&["claude", "hi"]), 1, &inv);
        assert_eq!(
            out,
            argv(&["claude", "--thread", "abc", "--fresh", "true", "hi"])
        );
    }

    #[test]
    fn pi_gets_print_flag_mode_and_think() {
        let mut inv = invocation(true);
        inv.format = Some("json".to_string());
        inv.think = ThinkLevel::High;
        let (out, body) = build_args(AgentKind::Pi, argv(&["pi", "hello"]), 1, &inv);
        assert_eq!(out[0], "pi");
        assert_eq!(out[1], "-p");
        assert!(out.windows(2).any(|w| w[0] == "--session" && w[1] == "abc"));
        assert!(out.windows(2).any(|w| w[0] == "--mode" && w[1] == "json"));
        assert!(out.windows(2).any(|w| w[0] == "--think" && w[1] == "high"));
        assert_eq!(out[body], "hello");
    }

    #[test]
    fn pi_identity_prefix_honours_system_sent() {
        let mut inv = invocation(true);
        inv.identity_prefix = Some("You are the relay.".to_string());
        let (out, body) = build_args(AgentKind::Pi, argv(&["pi", "-p", "hello"]), 2, &inv);
        assert!(out[body].starts_with("You are the relay.\n\n"));

        inv.system_sent = true;
        let (out, body) = build_args(AgentKind::Pi, argv(&["pi", "-p", "hello"]), 2, &inv);
        assert_eq!(out[body], "hello");
    }

    #[test]
    fn claude_stream_parses_and_dedups() {
        let raw = concat!(
            r#"{"type":"system","model":"claude-x"}"#, "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"same answer"}]}}"#, "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"same answer"}]}}"#, "\n",
            "this line is garbage\n",
            r#"{"type":"result","subtype":"success","usage":{"output_tokens":7},"result":"same answer"}"#, "\n",
        );
        let parsed = parse_output(AgentKind::Claude, raw);
        assert_eq!(parsed.texts, vec!["same answer".to_string()]);
        assert_eq!(parsed.meta.model.as_deref(), Some("claude-x"));
        assert_eq!(parsed.meta.stop_reason.as_deref(), Some("success"));
        assert!(parsed.meta.usage.is_some());
    }

    #[test]
    fn claude_tool_traffic_lands_in_tool_results() {
        let raw = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"bash"}]}}"#, "\n",
            r#"{"type":"user","message":{"content":[{"type":"tool_result","content":[{"type":"text","text":"ok"}]}]}}"#, "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}"#, "\n",
        );
        let parsed = parse_output(AgentKind::Claude, raw);
        assert_eq!(parsed.texts, vec!["done".to_string()]);
        assert_eq!(
            parsed.tool_results,
            vec!["[tool_use] bash".to_string(), "[tool_result] ok".to_string()]
        );
    }

    #[test]
    fn claude_result_text_used_only_as_fallback() {
        let raw = r#"{"type":"result","subtype":"success","result":"fallback text"}"#;
        let parsed = parse_output(AgentKind::Claude, raw);
        assert_eq!(parsed.texts, vec!["fallback text".to_string()]);
    }

    #[test]
    fn pi_stream_splits_roles() {
        let raw = concat!(
            r#"{"type":"message","role":"assistant","content":[{"type":"text","text":"hi"}]}"#, "\n",
            r#"{"type":"message","role":"toolResult","content":[{"type":"text","text":"ls output"}]}"#, "\n",
            r#"{"type":"message","role":"assistant","content":"bye"}"#, "\n",
        );
        let parsed = parse_output(AgentKind::Pi, raw);
        assert_eq!(parsed.texts, vec!["hi".to_string(), "bye".to_string()]);
        assert_eq!(parsed.tool_results, vec!["ls output".to_string()]);
    }

    #[test]
    fn codex_stream_takes_agent_messages() {
        let raw = concat!(
            r#"{"msg":{"type":"task_started"}}"#, "\n",
            r#"{"msg":{"type":"agent_message","message":"result here"}}"#, "\n",
        );
        let parsed = parse_output(AgentKind::Codex, raw);
        assert_eq!(parsed.texts, vec!["result here".to_string()]);
    }

    #[test]
    fn plain_kinds_return_trimmed_text() {
        let parsed = parse_output(AgentKind::Gemini, "  the answer\n");
        assert_eq!(parsed.texts, vec!["the answer".to_string()]);
        assert!(parse_output(AgentKind::Opencode, "   ").texts.is_empty());
    }

    #[test]
    fn non_json_stream_falls_back_to_plain() {
        let parsed = parse_output(AgentKind::Claude, "just plain words");
        assert_eq!(parsed.texts, vec!["just plain words".to_string()]);
    }
}
