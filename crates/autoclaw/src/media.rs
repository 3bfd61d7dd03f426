use std::path::Path;

/// Extensions recognised as media when they appear on an absolute local path.
const MEDIA_EXTENSIONS: [&str; 13] = [
    "jpg", "jpeg", "png", "gif", "webp", "mp3", "ogg", "wav", "m4a", "mp4", "mov", "webm", "pdf",
];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaSplit {
    pub text: String,
    pub media_urls: Vec<String>,
}

/// Separate media references from prose in agent output.
///
/// A whitespace-delimited token is media iff it is an absolute http(s) URL,
/// or an absolute filesystem path with a media extension. Tokens are matched
/// exactly; no trailing-punctuation trimming.
pub fn split_media(text: &str) -> MediaSplit {
    let mut media_urls = Vec::new();
    let mut kept_lines = Vec::new();

    for line in text.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        if !words.iter().any(|word| is_media_token(word)) {
            kept_lines.push(line.to_string());
            continue;
        }
        let mut kept_words = Vec::new();
        for word in words {
            if is_media_token(word) {
                media_urls.push(word.to_string());
            } else {
                kept_words.push(word);
            }
        }
        if !kept_words.is_empty() {
            kept_lines.push(kept_words.join(" "));
        }
    }

    MediaSplit {
        text: kept_lines.join("\n").trim().to_string(),
        media_urls,
    }
}

pub fn is_http_url(token: &str) -> bool {
    let rest = token
        .strip_prefix("https://")
        .or_else(|| token.strip_prefix("http://"));
    rest.is_some_and(|rest| !rest.is_empty())
}

fn is_media_token(token: &str) -> bool {
    if is_http_url(token) {
        return true;
    }
    if !token.starts_with('/') {
        return false;
    }
    Path::new(token)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            let lowered = ext.to_ascii_lowercase();
            MEDIA_EXTENSIONS.iter().any(|known| *known == lowered)
        })
}

/// Drop local media paths above the configured size cap. http(s) URLs pass
/// through unconditionally; unreadable local paths are dropped.
pub async fn filter_media_by_size(media_urls: Vec<String>, max_mb: Option<f64>) -> Vec<String> {
    let Some(max_mb) = max_mb else {
        return media_urls;
    };
    let max_bytes = (max_mb * 1024.0 * 1024.0) as u64;

    let mut kept = Vec::new();
    for url in media_urls {
        if is_http_url(&url) {
            kept.push(url);
            continue;
        }
        match tokio::fs::metadata(&url).await {
            Ok(meta) if meta.len() <= max_bytes => kept.push(url),
            Ok(meta) => {
                tracing::info!(
                    "dropping oversized media {url}: {} bytes over {max_bytes}",
                    meta.len()
                );
            }
            Err(err) => {
                tracing::warn!("dropping unreadable media {url}: {err}");
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_urls_and_media_paths() {
        let split = split_media("here you go https://example.com/a.png and /tmp/out.mp3 done");
        assert_eq!(
            split.media_urls,
            vec![
                "https://example.com/a.png".to_string(),
                "/tmp/out.mp3".to_string()
            ]
        );
        assert_eq!(split.text, "here you go and done");
    }

    #[test]
    fn ignores_relative_paths_and_non_media_extensions() {
        let split = split_media("see notes/todo.txt and /etc/passwd");
        assert!(split.media_urls.is_empty());
        assert_eq!(split.text, "see notes/todo.txt and /etc/passwd");
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let split = split_media("/data/photo.JPG");
        assert_eq!(split.media_urls, vec!["/data/photo.JPG".to_string()]);
        assert!(split.text.is_empty());
    }

    #[test]
    fn plain_lines_are_untouched() {
        let split = split_media("line  with  spacing\nanother line");
        assert_eq!(split.text, "line  with  spacing\nanother line");
    }

    #[tokio::test]
    async fn size_cap_keeps_urls_and_small_files() {
        let path = std::env::temp_dir().join("autoclaw-media-cap-test.png");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let kept = filter_media_by_size(
            vec![
                "https://example.com/big.png".to_string(),
                path.to_string_lossy().to_string(),
            ],
            Some(0.001),
        )
        .await;
        assert_eq!(kept, vec!["https://example.com/big.png".to_string()]);

        let kept = filter_media_by_size(
            vec![path.to_string_lossy().to_string()],
            Some(1.0),
        )
        .await;
        assert_eq!(kept.len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn no_cap_passes_everything() {
        let media = vec!["/nope/missing.png".to_string()];
        let kept = filter_media_by_size(media.clone(), None).await;
        assert_eq!(kept, media);
    }
}
