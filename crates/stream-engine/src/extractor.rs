use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(90);
const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported url")]
    UnsupportedUrl,
    #[error("video unavailable")]
    VideoUnavailable,
    #[error("region locked")]
    RegionLocked,
    #[error("extractor failed: {0}")]
    ExtractorFailed(String),
    #[error("no stream url in extractor output")]
    NoStreamUrl,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    format_note: Option<String>,
    url: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    tbr: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    id: Option<String>,
    title: Option<String>,
    duration: Option<i64>,
    thumbnail: Option<String>,
    url: Option<String>,
    format_id: Option<String>,
    format: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

/// The resolved media source chosen out of an extractor invocation.
#[derive(Debug, Clone)]
pub struct StreamMetadata {
    pub id: String,
    pub title: String,
    pub duration_secs: i64,
    pub thumbnail: Option<String>,
    pub url: String,
    pub format_id: String,
    pub format_note: String,
}

/// Wraps the extractor binary (a yt-dlp-compatible tool).
pub struct ExtractorAdapter {
    binary: String,
    dev_mode: bool,
    cache: Mutex<HashMap<String, (StreamMetadata, Instant)>>,
}

impl ExtractorAdapter {
    pub fn new(binary: impl Into<String>, dev_mode: bool) -> Self {
        Self {
            binary: binary.into(),
            dev_mode,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn extract(&self, source_url: &str) -> Result<StreamMetadata, ExtractError> {
        if self.dev_mode {
            if let Some(cached) = self.cache_lookup(source_url) {
                return Ok(cached);
            }
        }

        let output = timeout(EXTRACT_TIMEOUT, self.run(source_url))
            .await
            .map_err(|_| ExtractError::ExtractorFailed("extractor timed out".to_string()))??;

        let metadata = parse_and_select(&output)?;

        if self.dev_mode {
            self.cache_store(source_url, metadata.clone());
        }

        Ok(metadata)
    }

    async fn run(&self, source_url: &str) -> Result<Vec<u8>, ExtractError> {
        let output = Command::new(&self.binary)
            .args([
                "-j",
                "--no-warnings",
                "--no-playlist",
                "--skip-download",
                "-f",
                "best[acodec!=none][vcodec!=none]/best",
                source_url,
            ])
            .output()
            .await
            .map_err(|e| ExtractError::ExtractorFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(classify_stderr(&output.stderr));
        }

        Ok(output.stdout)
    }

    fn cache_lookup(&self, key: &str) -> Option<StreamMetadata> {
        let mut cache = self.cache.lock().expect("extractor cache mutex poisoned");
        match cache.get(key) {
            Some((metadata, stored_at)) if stored_at.elapsed() < CACHE_TTL => {
                Some(metadata.clone())
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_store(&self, key: &str, metadata: StreamMetadata) {
        let mut cache = self.cache.lock().expect("extractor cache mutex poisoned");
        cache.insert(key.to_string(), (metadata, Instant::now()));
    }
}

fn classify_stderr(stderr: &[u8]) -> ExtractError {
    let text = String::from_utf8_lossy(stderr).to_lowercase();
    if text.contains("unsupported url") {
        ExtractError::UnsupportedUrl
    } else if text.contains("video unavailable")
        || text.contains("private video")
        || text.contains("this video is private")
    {
        ExtractError::VideoUnavailable
    } else if text.contains("not available in your country") || text.contains("geo") {
        ExtractError::RegionLocked
    } else {
        let trimmed = String::from_utf8_lossy(stderr).trim().to_string();
        if trimmed.is_empty() {
            ExtractError::ExtractorFailed("extractor exited with an error".to_string())
        } else {
            ExtractError::ExtractorFailed(trimmed)
        }
    }
}

fn parse_and_select(stdout: &[u8]) -> Result<StreamMetadata, ExtractError> {
    let raw: RawPayload = serde_json::from_slice(stdout)
        .map_err(|e| ExtractError::ExtractorFailed(format!("invalid extractor output: {e}")))?;

    let (url, format_id, format_note) = choose_best_muxed(&raw.formats)
        .unwrap_or((raw.url.clone(), raw.format_id.clone(), raw.format.clone()));

    let url = url.unwrap_or_default();
    if url.is_empty() {
        return Err(ExtractError::NoStreamUrl);
    }

    Ok(StreamMetadata {
        id: raw.id.unwrap_or_default(),
        title: raw.title.unwrap_or_default(),
        duration_secs: raw.duration.unwrap_or(0),
        thumbnail: raw.thumbnail,
        url,
        format_id: format_id.unwrap_or_default(),
        format_note: format_note.unwrap_or_default(),
    })
}

/// Filters to muxed formats (non-empty URL, both codecs present) and picks
/// the one with the highest total bitrate. Ties keep the first-seen entry,
/// since `sort_by` is stable.
fn choose_best_muxed(
    formats: &[RawFormat],
) -> Option<(Option<String>, Option<String>, Option<String>)> {
    let mut muxed: Vec<&RawFormat> = formats
        .iter()
        .filter(|f| {
            let has_url = f.url.as_deref().is_some_and(|u| !u.is_empty());
            let has_video = f.vcodec.as_deref().is_some_and(|c| c != "none");
            let has_audio = f.acodec.as_deref().is_some_and(|c| c != "none");
            has_url && has_video && has_audio
        })
        .collect();

    if muxed.is_empty() {
        return None;
    }

    muxed.sort_by(|a, b| {
        let a_tbr = a.tbr.unwrap_or(0.0);
        let b_tbr = b.tbr.unwrap_or(0.0);
        b_tbr.partial_cmp(&a_tbr).unwrap_or(std::cmp::Ordering::Equal)
    });

    let best = muxed[0];
    Some((best.url.clone(), best.format_id.clone(), best.format_note.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(url: &str, vcodec: &str, acodec: &str, tbr: f64) -> RawFormat {
        RawFormat {
            format_id: Some(format!("f-{tbr}")),
            format_note: Some("note".to_string()),
            url: Some(url.to_string()),
            vcodec: Some(vcodec.to_string()),
            acodec: Some(acodec.to_string()),
            tbr: Some(tbr),
        }
    }

    #[test]
    fn picks_highest_bitrate_muxed_format() {
        let formats = vec![
            fmt("low", "av01", "aac", 500.0),
            fmt("high", "av01", "aac", 1500.0),
            fmt("video-only", "av01", "none", 5000.0),
        ];
        let (url, _, _) = choose_best_muxed(&formats).unwrap();
        assert_eq!(url.as_deref(), Some("high"));
    }

    #[test]
    fn ties_keep_first_seen_entry() {
        let formats = vec![fmt("first", "av01", "aac", 1000.0), fmt("second", "av01", "aac", 1000.0)];
        let (url, _, _) = choose_best_muxed(&formats).unwrap();
        assert_eq!(url.as_deref(), Some("first"));
    }

    #[test]
    fn falls_back_to_top_level_fields_without_muxed_formats() {
        let raw = RawPayload {
            id: Some("abc".to_string()),
            title: Some("t".to_string()),
            duration: Some(10),
            thumbnail: None,
            url: Some("top-level-url".to_string()),
            format_id: Some("fid".to_string()),
            format: Some("fnote".to_string()),
            formats: vec![fmt("video-only", "av01", "none", 10.0)],
        };
        let bytes = serde_json::to_vec(&serde_json::json!({
            "id": raw.id, "title": raw.title, "duration": raw.duration,
            "url": raw.url, "format_id": raw.format_id, "format": raw.format,
            "formats": [{"format_id":"v","vcodec":"av01","acodec":"none","url":"video-only","tbr":10.0}]
        }))
        .unwrap();
        let metadata = parse_and_select(&bytes).unwrap();
        assert_eq!(metadata.url, "top-level-url");
    }

    #[test]
    fn classifies_known_stderr_fragments() {
        assert!(matches!(
            classify_stderr(b"ERROR: Unsupported URL: foo"),
            ExtractError::UnsupportedUrl
        ));
        assert!(matches!(
            classify_stderr(b"this video is Private"),
            ExtractError::VideoUnavailable
        ));
        assert!(matches!(
            classify_stderr(b"The uploader has not made this video available in your country"),
            ExtractError::RegionLocked
        ));
        assert!(matches!(
            classify_stderr(b"some other failure"),
            ExtractError::ExtractorFailed(_)
        ));
    }

    #[test]
    fn empty_stderr_yields_generic_message() {
        match classify_stderr(b"") {
            ExtractError::ExtractorFailed(msg) => assert!(!msg.is_empty()),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
