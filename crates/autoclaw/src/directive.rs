//! Inline directive extraction from an inbound message body.
//!
//! Directives ride inside the message text: `/think:high`, `/verbose on`,
//! abort words, and session reset triggers. Parsing strips recognised tokens
//! and reports what they requested; resolution against session and config
//! defaults happens in the reply engine.

use serde::{Deserialize, Serialize};

const ABORT_WORDS: [&str; 5] = ["stop", "esc", "abort", "wait", "exit"];

const THINK_PREFIXES: [&str; 3] = ["/thinking", "/think", "/t"];
const VERBOSE_PREFIXES: [&str; 2] = ["/verbose", "/v"];

/// Every word the directive grammar recognises as a value, either family.
const DIRECTIVE_VALUE_WORDS: [&str; 9] = [
    "off", "minimal", "low", "medium", "high", "max", "highest", "on", "full",
];

fn is_directive_value_word(word: &str) -> bool {
    let lowered = word.to_ascii_lowercase();
    DIRECTIVE_VALUE_WORDS.iter().any(|known| *known == lowered)
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThinkLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

impl ThinkLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" | "max" | "highest" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Trailing cue word appended to the prompt for agents that take their
    /// thinking budget from the prompt text.
    pub fn cue_word(self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Minimal => Some("think"),
            Self::Low => Some("think hard"),
            Self::Medium => Some("think harder"),
            Self::High => Some("ultrathink"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerboseLevel {
    #[default]
    Off,
    On,
}

impl VerboseLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "on" | "full" => Some(Self::On),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Directives {
    pub think: Option<ThinkLevel>,
    pub verbose: Option<VerboseLevel>,
    /// Directive tokens with an unrecognised value, e.g. `/think:banana`.
    pub invalid: Vec<String>,
    pub reset_requested: bool,
    pub abort_requested: bool,
    pub directive_only: bool,
    pub stripped_body: String,
}

pub fn parse_directives(body: &str, reset_triggers: &[String]) -> Directives {
    let trimmed = body.trim();
    let mut out = Directives::default();

    let lowered = trimmed.to_ascii_lowercase();
    if ABORT_WORDS.iter().any(|word| *word == lowered) {
        out.abort_requested = true;
        out.stripped_body = trimmed.to_string();
        return out;
    }

    let mut remainder = trimmed;
    for trigger in reset_triggers {
        if trimmed.eq_ignore_ascii_case(trigger) {
            out.reset_requested = true;
            remainder = "";
            break;
        }
        let prefix = format!("{trigger} ");
        if lowered.starts_with(&prefix.to_ascii_lowercase()) {
            out.reset_requested = true;
            remainder = trimmed[prefix.len()..].trim_start();
            break;
        }
    }

    let mut saw_directive = false;
    let mut kept_lines = Vec::new();
    for line in remainder.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        let mut kept_words: Vec<&str> = Vec::new();
        let mut line_had_directive = false;
        let mut index = 0;
        while index < words.len() {
            let word = words[index];
            match classify_word(word, words.get(index + 1).copied()) {
                WordKind::Think(level, consumed) => {
                    out.think = Some(level);
                    saw_directive = true;
                    line_had_directive = true;
                    index += consumed;
                }
                WordKind::Verbose(level, consumed) => {
                    out.verbose = Some(level);
                    saw_directive = true;
                    line_had_directive = true;
                    index += consumed;
                }
                WordKind::Invalid => {
                    out.invalid.push(word.to_string());
                    saw_directive = true;
                    line_had_directive = true;
                    index += 1;
                }
                WordKind::Plain => {
                    kept_words.push(word);
                    index += 1;
                }
            }
        }
        if line_had_directive {
            if !kept_words.is_empty() {
                kept_lines.push(kept_words.join(" "));
            }
        } else {
            kept_lines.push(line.to_string());
        }
    }

    out.stripped_body = kept_lines.join("\n").trim().to_string();
    out.directive_only =
        out.stripped_body.is_empty() && (saw_directive || out.reset_requested);
    out
}

enum WordKind {
    Think(ThinkLevel, usize),
    Verbose(VerboseLevel, usize),
    Invalid,
    Plain,
}

fn classify_word(word: &str, next: Option<&str>) -> WordKind {
    let lowered = word.to_ascii_lowercase();

    if let Some(value) = match_prefix(&lowered, &THINK_PREFIXES) {
        return match value {
            PrefixValue::Inline(raw) => match ThinkLevel::parse(raw) {
                Some(level) => WordKind::Think(level, 1),
                // A directive-vocabulary word on the wrong family gets the
                // hint; anything else is not a directive token and stays in
                // the body.
                None if is_directive_value_word(raw) => WordKind::Invalid,
                None => WordKind::Plain,
            },
            PrefixValue::Bare => match next.and_then(ThinkLevel::parse) {
                Some(level) => WordKind::Think(level, 2),
                None => WordKind::Plain,
            },
        };
    }

    if let Some(value) = match_prefix(&lowered, &VERBOSE_PREFIXES) {
        return match value {
            PrefixValue::Inline(raw) => match VerboseLevel::parse(raw) {
                Some(level) => WordKind::Verbose(level, 1),
                None if is_directive_value_word(raw) => WordKind::Invalid,
                None => WordKind::Plain,
            },
            PrefixValue::Bare => match next.and_then(VerboseLevel::parse) {
                Some(level) => WordKind::Verbose(level, 2),
                None => WordKind::Plain,
            },
        };
    }

    WordKind::Plain
}

enum PrefixValue<'a> {
    /// `/think:high` — value rides in the same word.
    Inline(&'a str),
    /// `/think high` — value is the next word, if any.
    Bare,
}

fn match_prefix<'a>(lowered: &'a str, prefixes: &[&str]) -> Option<PrefixValue<'a>> {
    for prefix in prefixes {
        if lowered == *prefix {
            return Some(PrefixValue::Bare);
        }
        if let Some(rest) = lowered.strip_prefix(prefix) {
            if let Some(value) = rest.strip_prefix(':') {
                return Some(PrefixValue::Inline(value));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Directives {
        parse_directives(body, &["/new".to_string(), "/reset".to_string()])
    }

    #[test]
    fn abort_words_match_case_insensitively() {
        for word in ["stop", "STOP", " Esc ", "abort", "wait", "exit"] {
            let directives = parse(word);
            assert!(directives.abort_requested, "expected abort for {word:?}");
        }
        assert!(!parse("stop it").abort_requested);
    }

    #[test]
    fn colon_and_space_forms_both_parse() {
        assert_eq!(parse("/think:high").think, Some(ThinkLevel::High));
        assert_eq!(parse("/think high").think, Some(ThinkLevel::High));
        assert_eq!(parse("/t:low").think, Some(ThinkLevel::Low));
        assert_eq!(parse("/thinking medium").think, Some(ThinkLevel::Medium));
        assert_eq!(parse("/v on").verbose, Some(VerboseLevel::On));
        assert_eq!(parse("/verbose:off").verbose, Some(VerboseLevel::Off));
    }

    #[test]
    fn aliases_normalise() {
        assert_eq!(parse("/think:max").think, Some(ThinkLevel::High));
        assert_eq!(parse("/think highest").think, Some(ThinkLevel::High));
        assert_eq!(parse("/verbose full").verbose, Some(VerboseLevel::On));
    }

    #[test]
    fn last_directive_wins() {
        let directives = parse("/think:low do the thing /think:high");
        assert_eq!(directives.think, Some(ThinkLevel::High));
        assert_eq!(directives.stripped_body, "do the thing");
    }

    #[test]
    fn directive_only_detection() {
        let directives = parse("/think:high /verbose on");
        assert!(directives.directive_only);
        assert!(directives.stripped_body.is_empty());

        let mixed = parse("/think:high summarise this");
        assert!(!mixed.directive_only);
        assert_eq!(mixed.stripped_body, "summarise this");
    }

    #[test]
    fn wrong_family_value_is_recorded_and_stripped() {
        let directives = parse("/think:on");
        assert!(directives.think.is_none());
        assert_eq!(directives.invalid, vec!["/think:on".to_string()]);
        assert!(directives.directive_only);

        let verbose = parse("/verbose:high");
        assert!(verbose.verbose.is_none());
        assert_eq!(verbose.invalid, vec!["/verbose:high".to_string()]);
    }

    #[test]
    fn unrecognised_values_stay_in_the_body() {
        for body in ["/think:banana", "/think:highx", "/t:lowish", "/v:maybe"] {
            let directives = parse(body);
            assert!(directives.think.is_none(), "for {body:?}");
            assert!(directives.verbose.is_none(), "for {body:?}");
            assert!(directives.invalid.is_empty(), "for {body:?}");
            assert!(!directives.directive_only, "for {body:?}");
            assert_eq!(directives.stripped_body, body, "for {body:?}");
        }
    }

    #[test]
    fn bare_prefix_without_value_stays_in_body() {
        let directives = parse("what does /think do");
        assert!(directives.think.is_none());
        assert!(directives.invalid.is_empty());
        assert_eq!(directives.stripped_body, "what does /think do");
    }

    #[test]
    fn reset_trigger_exact_and_prefixed() {
        let exact = parse("/new");
        assert!(exact.reset_requested);
        assert!(exact.directive_only);

        let prefixed = parse("/new plan my week");
        assert!(prefixed.reset_requested);
        assert!(!prefixed.directive_only);
        assert_eq!(prefixed.stripped_body, "plan my week");

        assert!(!parse("/newish idea").reset_requested);
    }

    #[test]
    fn untouched_lines_survive_verbatim() {
        let directives = parse("first  line\n/think:high\nsecond line");
        assert_eq!(directives.stripped_body, "first  line\nsecond line");
    }

    #[test]
    fn cue_words_map_levels() {
        assert_eq!(ThinkLevel::Minimal.cue_word(), Some("think"));
        assert_eq!(ThinkLevel::Low.cue_word(), Some("think hard"));
        assert_eq!(ThinkLevel::Medium.cue_word(), Some("think harder"));
        assert_eq!(ThinkLevel::High.cue_word(), Some("ultrathink"));
        assert_eq!(ThinkLevel::Off.cue_word(), None);
    }
}
