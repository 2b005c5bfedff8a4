#![forbid(unsafe_code)]

//! Maps source URLs onto `(platform, stable id)` pairs. The stable id is the
//! dedup key for files on disk, JSON records and CSV rows.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use url::Url;

static RUTUBE_VIDEO_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/video/([A-Za-z0-9_-]+)").expect("valid rutube video regex"));
static RUTUBE_PLST_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/plst/(\d+)").expect("valid rutube plst regex"));
static SAFE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid id regex"));

/// Ids name files and directories, so they are limited to
/// `[A-Za-z0-9_-]+`.
pub fn is_safe_id(candidate: &str) -> bool {
    SAFE_ID.is_match(candidate)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Rutube,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Rutube => "rutube",
        }
    }

    /// Canonical watch URL for a video id on this platform.
    pub fn video_url(self, video_id: &str) -> String {
        match self {
            Self::Youtube => format!("https://www.youtube.com/watch?v={video_id}"),
            Self::Rutube => format!("https://rutube.ru/video/{video_id}/"),
        }
    }

    fn from_host(host: &str) -> Option<Self> {
        match host {
            "youtube.com" | "www.youtube.com" | "m.youtube.com" | "youtu.be" => {
                Some(Self::Youtube)
            }
            "rutube.ru" | "www.rutube.ru" => Some(Self::Rutube),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the item list. Identity is `(platform, stable_id)`; the source
/// URL is kept verbatim because that is what the tools are handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    platform: Platform,
    stable_id: String,
    source_url: String,
}

impl ItemRef {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn stable_id(&self) -> &str {
        &self.stable_id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }
}

/// Resolves a video URL. Returns `None` for unsupported hosts or URLs that
/// carry no recognizable id.
pub fn resolve_video(source_url: &str) -> Option<ItemRef> {
    let parsed = Url::parse(source_url.trim()).ok()?;
    let platform = Platform::from_host(parsed.host_str()?)?;
    let stable_id = match platform {
        Platform::Youtube => youtube_video_id(&parsed)?,
        Platform::Rutube => RUTUBE_VIDEO_PATH
            .captures(parsed.path())?
            .get(1)?
            .as_str()
            .to_string(),
    };
    Some(ItemRef {
        platform,
        stable_id,
        source_url: source_url.trim().to_string(),
    })
}

fn youtube_video_id(parsed: &Url) -> Option<String> {
    let candidate = if parsed.host_str() == Some("youtu.be") {
        parsed.path_segments()?.next().map(str::to_string)
    } else if let Some(rest) = parsed.path().strip_prefix("/shorts/") {
        rest.split('/').next().map(str::to_string)
    } else {
        parsed
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned())
    }?;
    is_safe_id(&candidate).then_some(candidate)
}

/// A playlist URL resolved to its platform and id; the id names the playlist's
/// output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRef {
    pub platform: Platform,
    pub playlist_id: String,
    pub source_url: String,
}

/// Returns `None` for unsupported hosts and for ids that are not safe to use
/// as a directory name.
pub fn resolve_playlist(source_url: &str) -> Option<PlaylistRef> {
    let parsed = Url::parse(source_url.trim()).ok()?;
    let platform = Platform::from_host(parsed.host_str()?)?;
    let playlist_id = match platform {
        Platform::Youtube => parsed
            .query_pairs()
            .find(|(key, _)| key == "list")
            .map(|(_, value)| value.into_owned())?,
        Platform::Rutube => {
            let mut segments = parsed.path_segments()?;
            match (segments.next(), segments.next()) {
                (Some("playlists"), Some(id)) if !id.is_empty() => id.to_string(),
                _ => RUTUBE_PLST_PATH
                    .captures(parsed.path())?
                    .get(1)?
                    .as_str()
                    .to_string(),
            }
        }
    };
    if !is_safe_id(&playlist_id) {
        return None;
    }
    Some(PlaylistRef {
        platform,
        playlist_id,
        source_url: source_url.trim().to_string(),
    })
}

/// Reads a list file: one URL per line, surrounding whitespace trimmed, blank
/// lines ignored.
pub fn read_url_list(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading url list {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(item: &ItemRef) -> (Platform, &str) {
        (item.platform(), item.stable_id())
    }

    #[test]
    fn resolves_youtube_watch_urls() {
        let item = resolve_video("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        assert_eq!(item.platform(), Platform::Youtube);
        assert_eq!(item.stable_id(), "dQw4w9WgXcQ");
        assert_eq!(
            item.source_url(),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[test]
    fn query_noise_does_not_change_identity() {
        let plain = resolve_video("https://www.youtube.com/watch?v=abc123").unwrap();
        let noisy =
            resolve_video("https://youtube.com/watch?list=PL1&v=abc123&t=42s&index=3").unwrap();
        assert_eq!(key(&plain), key(&noisy));
        assert_ne!(plain.source_url(), noisy.source_url());

        let short = resolve_video("https://youtu.be/abc123?si=share").unwrap();
        assert_eq!(key(&plain), key(&short));
    }

    #[test]
    fn resolves_rutube_video_paths() {
        let item = resolve_video("https://rutube.ru/video/a1b2c3d4e5/?playlist=9").unwrap();
        assert_eq!(item.platform(), Platform::Rutube);
        assert_eq!(item.stable_id(), "a1b2c3d4e5");
        let bare = resolve_video("https://www.rutube.ru/video/a1b2c3d4e5").unwrap();
        assert_eq!(key(&item), key(&bare));
    }

    #[test]
    fn rejects_unknown_or_idless_urls() {
        assert!(resolve_video("not a url").is_none());
        assert!(resolve_video("https://vimeo.com/12345").is_none());
        assert!(resolve_video("https://www.youtube.com/watch").is_none());
        assert!(resolve_video("https://www.youtube.com/watch?v=").is_none());
        assert!(resolve_video("https://rutube.ru/channel/42/").is_none());
    }

    #[test]
    fn resolves_playlists() {
        let yt = resolve_playlist("https://www.youtube.com/playlist?list=PLabc").unwrap();
        assert_eq!(yt.platform, Platform::Youtube);
        assert_eq!(yt.playlist_id, "PLabc");

        let ru = resolve_playlist("https://rutube.ru/playlists/123456/").unwrap();
        assert_eq!(ru.platform, Platform::Rutube);
        assert_eq!(ru.playlist_id, "123456");

        let plst = resolve_playlist("https://rutube.ru/plst/98765/").unwrap();
        assert_eq!(plst.playlist_id, "98765");

        assert!(resolve_playlist("https://www.youtube.com/watch?v=abc").is_none());
        assert!(resolve_playlist("https://example.com/playlist?list=x").is_none());
    }

    #[test]
    fn playlist_ids_cannot_escape_the_output_dir() {
        assert!(resolve_playlist("https://www.youtube.com/playlist?list=%2Ftmp%2Fevil").is_none());
        assert!(resolve_playlist("https://www.youtube.com/playlist?list=..%2F..%2Fetc").is_none());
        assert!(resolve_playlist("https://www.youtube.com/playlist?list=..").is_none());
        assert!(resolve_playlist("https://www.youtube.com/playlist?list=").is_none());
        assert!(resolve_playlist("https://rutube.ru/playlists/a%2Fb/").is_none());
        assert!(resolve_playlist("https://www.youtube.com/playlist?list=PL_a-1").is_some());
    }

    #[test]
    fn canonical_video_urls() {
        assert_eq!(
            Platform::Youtube.video_url("abc"),
            "https://www.youtube.com/watch?v=abc"
        );
        assert_eq!(Platform::Rutube.video_url("xyz"), "https://rutube.ru/video/xyz/");
    }

    #[test]
    fn url_list_skips_blank_lines() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("urls.txt");
        fs::write(&path, "  https://a.example/1  \n\n\t\nhttps://b.example/2\n")?;
        let urls = read_url_list(&path)?;
        assert_eq!(urls, vec!["https://a.example/1", "https://b.example/2"]);
        assert!(read_url_list(&dir.path().join("missing.txt")).is_err());
        Ok(())
    }
}
