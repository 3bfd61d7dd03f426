use crate::runner;
use crate::template::{self, TemplateContext};
use common::config::TranscribeAudioConfig;
use std::path::Path;
use std::time::Duration;

const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "ogg", "oga", "opus", "wav", "m4a", "aac"];

pub fn is_audio_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            let lowered = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.iter().any(|known| *known == lowered)
        })
}

/// Run the configured transcription CLI over one media file.
///
/// Returns the trimmed transcript, or `None` on any failure so the caller
/// falls back to the original message body.
pub async fn transcribe(config: &TranscribeAudioConfig, media_path: &str) -> Option<String> {
    let ctx = TemplateContext {
        media_path: Some(media_path.to_string()),
        ..TemplateContext::default()
    };
    let argv: Vec<String> = config
        .command
        .iter()
        .map(|arg| template::apply(arg, &ctx))
        .collect();
    if argv.is_empty() {
        return None;
    }

    let timeout = Duration::from_secs(config.timeout_seconds);
    match runner::run_command(&argv, None, timeout).await {
        Ok(output) if output.success() => {
            let transcript = output.stdout.trim();
            if transcript.is_empty() {
                tracing::warn!("transcription produced no output for {media_path}");
                None
            } else {
                Some(transcript.to_string())
            }
        }
        Ok(output) => {
            tracing::warn!(
                "transcription failed for {media_path}: exit={:?} killed={}",
                output.exit_code,
                output.killed
            );
            None
        }
        Err(err) => {
            tracing::warn!("transcription spawn failed for {media_path}: {err}");
            None
        }
    }
}
