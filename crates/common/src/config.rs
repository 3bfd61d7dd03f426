use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
#[error("config error: {message}")]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level relay configuration, loaded from TOML.
///
/// Unknown keys anywhere in the tree are a load error, not a silent accept.
/// A missing config file yields `RelayConfig::default()`, which admits no
/// senders and therefore does nothing.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default)]
    pub inbound: InboundConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct InboundConfig {
    /// Senders permitted to trigger an auto-reply. `"*"` permits all.
    #[serde(default)]
    pub allow_from: Vec<String>,
    #[serde(default)]
    pub message_prefix: Option<String>,
    #[serde(default)]
    pub response_prefix: Option<String>,
    /// `false` = off, `true` = UTC, string = IANA zone name.
    #[serde(default)]
    pub timestamp_prefix: TimestampPrefix,
    /// Suppression rule for replies echoed back by a same-phone provider.
    #[serde(default)]
    pub self_echo_rule: SelfEchoRule,
    #[serde(default)]
    pub transcribe_audio: Option<TranscribeAudioConfig>,
    #[serde(default)]
    pub reply: ReplyConfig,
}

impl InboundConfig {
    /// Allowlist check, tolerant of `+`/`-`/space formatting differences.
    pub fn allows(&self, from: &str) -> bool {
        if self.allow_from.iter().any(|entry| entry == "*") {
            return true;
        }
        let sender = normalize_sender(from);
        if sender.is_empty() {
            return false;
        }
        self.allow_from.iter().any(|entry| {
            let allowed = normalize_sender(entry);
            !allowed.is_empty() && (sender.contains(&allowed) || allowed.contains(&sender))
        })
    }
}

fn normalize_sender(value: &str) -> String {
    value
        .split('@')
        .next()
        .unwrap_or(value)
        .replace([' ', '-', '+'], "")
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TimestampPrefix {
    #[default]
    Off,
    Utc,
    Zone(String),
}

impl<'de> Deserialize<'de> for TimestampPrefix {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Zone(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Self::Off,
            Raw::Flag(true) => Self::Utc,
            Raw::Zone(zone) => Self::Zone(zone),
        })
    }
}

impl Serialize for TimestampPrefix {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Off => serializer.serialize_bool(false),
            Self::Utc => serializer.serialize_bool(true),
            Self::Zone(zone) => serializer.serialize_str(zone),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SelfEchoRule {
    #[default]
    Off,
    Raw,
    Stripped,
    Prefixed,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TranscribeAudioConfig {
    pub command: Vec<String>,
    #[serde(default = "default_transcribe_timeout")]
    pub timeout_seconds: u64,
}

fn default_transcribe_timeout() -> u64 {
    60
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    #[default]
    Text,
    Command,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ReplyConfig {
    #[serde(default)]
    pub mode: ReplyMode,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub heartbeat_command: Option<Vec<String>>,
    /// Config-level thinking default (`off|minimal|low|medium|high`).
    #[serde(default)]
    pub thinking_default: Option<String>,
    /// Config-level verbosity default (`on|off`).
    #[serde(default)]
    pub verbose_default: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: f64,
    /// Prompt template; delivered per the session's `sendSystemOnce` rule.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub body_prefix: Option<String>,
    /// Static media URL attached to the first outbound payload.
    #[serde(default)]
    pub media_url: Option<String>,
    /// Size cap for local media emitted by the agent, in megabytes.
    #[serde(default)]
    pub media_max_mb: Option<f64>,
    #[serde(default)]
    pub typing_interval_seconds: Option<u64>,
    /// Heartbeat tick granularity; unset or 0 disables heartbeats.
    #[serde(default)]
    pub heartbeat_minutes: Option<u64>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_command_timeout() -> f64 {
    600.0
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            mode: ReplyMode::Text,
            text: None,
            command: Vec::new(),
            heartbeat_command: None,
            thinking_default: None,
            verbose_default: None,
            cwd: None,
            timeout_seconds: default_command_timeout(),
            template: None,
            body_prefix: None,
            media_url: None,
            media_max_mb: None,
            typing_interval_seconds: None,
            heartbeat_minutes: None,
            agent: AgentConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Agent kind override (`claude|opencode|pi|codex|gemini`); detected from
    /// the command basename when unset.
    #[serde(default)]
    pub kind: Option<String>,
    /// Output format hint (`text|json`); adds the agent-appropriate flag.
    #[serde(default)]
    pub format: Option<String>,
    /// Identity text prepended to the body for agents without a system slot.
    #[serde(default)]
    pub identity_prefix: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum SessionScope {
    #[default]
    #[serde(rename = "per-sender")]
    PerSender,
    #[serde(rename = "global")]
    Global,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub scope: SessionScope,
    #[serde(default = "default_reset_triggers")]
    pub reset_triggers: Vec<String>,
    /// Idle minutes after which a session expires.
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
    /// Heartbeat freshness window; falls back to `idleMinutes` when unset.
    #[serde(default)]
    pub heartbeat_idle_minutes: Option<u64>,
    /// Session store file path; defaults to a user-scoped state file.
    #[serde(default)]
    pub store: Option<PathBuf>,
    /// Custom session-flag argv fragment, templated with `{{SessionId}}` and
    /// `{{IsNewSession}}`; replaces the agent kind's default flags.
    #[serde(default)]
    pub args_template: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub session_arg_before_body: bool,
    #[serde(default = "default_true")]
    pub send_system_once: bool,
    /// Intro text joined ahead of the body on the first turn of a session.
    #[serde(default)]
    pub session_intro: Option<String>,
}

fn default_reset_triggers() -> Vec<String> {
    vec!["/new".to_string(), "/reset".to_string()]
}

fn default_idle_minutes() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scope: SessionScope::PerSender,
            reset_triggers: default_reset_triggers(),
            idle_minutes: default_idle_minutes(),
            heartbeat_idle_minutes: None,
            store: None,
            args_template: None,
            session_arg_before_body: true,
            send_system_once: true,
            session_intro: None,
        }
    }
}

impl SessionConfig {
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.store {
            return Ok(path.clone());
        }
        let data = dirs::data_local_dir().ok_or_else(|| ConfigError::new("data dir missing"))?;
        Ok(data.join("autoclaw").join("sessions.json"))
    }
}

pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };
    if !path.exists() {
        return Ok(RelayConfig::default());
    }
    let contents = std::fs::read_to_string(&path)
        .map_err(|err| ConfigError::new(format!("config read failed: {err}")))?;
    toml::from_str(&contents).map_err(|err| ConfigError::new(format!("config parse failed: {err}")))
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var("AUTOCLAWD_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| ConfigError::new("home dir missing"))?;
    Ok(home.join(".config/autoclaw/autoclawd.toml"))
}
