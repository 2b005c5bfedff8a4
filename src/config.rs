#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::supervisor::Toolchain;

pub const DEFAULT_CONFIG_PATH: &str = "bulktube.toml";
pub const DEFAULT_OUTPUT_DIR: &str = "downloads";
pub const DEFAULT_NUM_WORKERS: usize = 4;
pub const DEFAULT_PLAYLISTS_FILE: &str = "playlists.txt";
pub const DEFAULT_VIDEO_URLS_FILE: &str = "video_urls.txt";
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
pub const DEFAULT_YT_DLP: &str = "yt-dlp";
pub const DEFAULT_FFPROBE: &str = "ffprobe";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Requested video quality. `Best` lets the extraction tool pick the highest
/// available stream; `MaxHeight` bounds the video stream by pixel height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    MaxHeight(u32),
}

impl Quality {
    /// Accepts `720p`, `720` or `best` (case-insensitive).
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("best") {
            return Ok(Self::Best);
        }
        let digits = trimmed
            .strip_suffix('p')
            .or_else(|| trimmed.strip_suffix('P'))
            .unwrap_or(trimmed);
        let height: u32 = digits
            .parse()
            .with_context(|| format!("invalid video quality {value:?}, expected e.g. \"720p\""))?;
        if height == 0 {
            bail!("invalid video quality {value:?}: height must be positive");
        }
        Ok(Self::MaxHeight(height))
    }

    pub fn target_height(self) -> Option<u32> {
        match self {
            Self::Best => None,
            Self::MaxHeight(height) => Some(height),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => f.write_str("best available"),
            Self::MaxHeight(height) => write!(f, "{height}p"),
        }
    }
}

/// Raw shape of `bulktube.toml`. Every key is optional so a partial file only
/// overrides what it names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub video_quality: Option<String>,
    pub num_workers: Option<usize>,
    pub use_playlists: Option<bool>,
    pub playlists_file: Option<PathBuf>,
    pub video_urls_file: Option<PathBuf>,
    pub grace_period_secs: Option<u64>,
    pub extraction_timeout_secs: Option<u64>,
    pub yt_dlp: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    pub logging: LoggingFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingFileConfig {
    pub console_logging: Option<bool>,
    pub file_logging: Option<bool>,
    pub log_dir: Option<PathBuf>,
    pub level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub console: bool,
    pub file: bool,
    pub log_dir: PathBuf,
    pub level: String,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub quality: Quality,
    pub num_workers: usize,
    pub use_playlists: bool,
    /// Playlist list in playlist mode, video list otherwise.
    pub list_file: PathBuf,
    pub grace_period: Duration,
    pub extraction_timeout: Option<Duration>,
    pub yt_dlp: PathBuf,
    pub ffprobe: PathBuf,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            yt_dlp: self.yt_dlp.clone(),
            ffprobe: self.ffprobe.clone(),
            grace_period: self.grace_period,
            extraction_timeout: self.extraction_timeout,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub config_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub video_quality: Option<String>,
    pub num_workers: Option<usize>,
    pub use_playlists: Option<bool>,
    pub list_file: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let config_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let file = read_config_file(&config_path)?;
    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    build_settings_with_overrides(&file, &base_dir, env_var_string, overrides)
}

/// Reads the TOML config. A missing file yields the defaults; a malformed one
/// is an error.
pub fn read_config_file(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
}

fn build_settings_with_overrides(
    file: &FileConfig,
    base_dir: &Path,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let output_dir = overrides
        .output_dir
        .or_else(|| env_lookup("BULKTUBE_OUTPUT_DIR").map(PathBuf::from))
        .or_else(|| file.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));

    let quality_raw = overrides
        .video_quality
        .or_else(|| env_lookup("BULKTUBE_VIDEO_QUALITY"))
        .or_else(|| file.video_quality.clone());
    let quality = match quality_raw {
        Some(raw) => Quality::parse(&raw)?,
        None => Quality::Best,
    };

    let num_workers = overrides
        .num_workers
        .or_else(|| {
            env_lookup("BULKTUBE_NUM_WORKERS").and_then(|value| value.parse::<usize>().ok())
        })
        .or(file.num_workers)
        .unwrap_or(DEFAULT_NUM_WORKERS);
    if num_workers == 0 {
        bail!("num_workers must be at least 1");
    }

    let use_playlists = overrides
        .use_playlists
        .or(file.use_playlists)
        .unwrap_or(false);

    let list_file = match overrides.list_file {
        Some(path) => path,
        None => {
            let (configured, default) = if use_playlists {
                (file.playlists_file.as_ref(), DEFAULT_PLAYLISTS_FILE)
            } else {
                (file.video_urls_file.as_ref(), DEFAULT_VIDEO_URLS_FILE)
            };
            let path = configured
                .cloned()
                .unwrap_or_else(|| PathBuf::from(default));
            if path.is_relative() {
                base_dir.join(path)
            } else {
                path
            }
        }
    };

    let grace_period =
        Duration::from_secs(file.grace_period_secs.unwrap_or(DEFAULT_GRACE_PERIOD_SECS));
    let extraction_timeout = file
        .extraction_timeout_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    let yt_dlp = file
        .yt_dlp
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP));
    let ffprobe = file
        .ffprobe
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FFPROBE));

    let level = file
        .logging
        .level
        .clone()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    let logging = LoggingSettings {
        console: file.logging.console_logging.unwrap_or(true),
        file: file.logging.file_logging.unwrap_or(false),
        log_dir: file
            .logging
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
        level,
    };

    if output_dir.as_os_str().is_empty() {
        return Err(anyhow!("output_dir must not be empty"));
    }

    Ok(Settings {
        output_dir,
        quality,
        num_workers,
        use_playlists,
        list_file,
        grace_period,
        extraction_timeout,
        yt_dlp,
        ffprobe,
        logging,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let cfg = make_config(contents);
        let file = read_config_file(cfg.path()).unwrap();
        build_settings_with_overrides(
            &file,
            Path::new("/project"),
            |_| None,
            SettingsOverrides::default(),
        )
        .unwrap()
    }

    #[test]
    fn quality_parses_height_suffix() {
        assert_eq!(Quality::parse("720p").unwrap(), Quality::MaxHeight(720));
        assert_eq!(Quality::parse(" 1080 ").unwrap(), Quality::MaxHeight(1080));
        assert_eq!(Quality::parse("best").unwrap(), Quality::Best);
        assert!(Quality::parse("abc").is_err());
        assert!(Quality::parse("0p").is_err());
        assert_eq!(Quality::MaxHeight(480).to_string(), "480p");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let settings = settings_from("");
        assert_eq!(settings.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(settings.quality, Quality::Best);
        assert_eq!(settings.num_workers, DEFAULT_NUM_WORKERS);
        assert!(!settings.use_playlists);
        assert_eq!(
            settings.list_file,
            PathBuf::from("/project").join(DEFAULT_VIDEO_URLS_FILE)
        );
        assert_eq!(
            settings.grace_period,
            Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS)
        );
        assert!(settings.extraction_timeout.is_none());
        assert!(settings.logging.console);
        assert!(!settings.logging.file);
    }

    #[test]
    fn reads_values_and_logging_table() {
        let settings = settings_from(
            r#"
            output_dir = "/media/out"
            video_quality = "720p"
            num_workers = 2
            use_playlists = true
            playlists_file = "lists/playlists.txt"
            extraction_timeout_secs = 600

            [logging]
            file_logging = true
            log_dir = "/var/log/bulktube"
            level = "debug"
            "#,
        );
        assert_eq!(settings.output_dir, PathBuf::from("/media/out"));
        assert_eq!(settings.quality, Quality::MaxHeight(720));
        assert_eq!(settings.num_workers, 2);
        assert!(settings.use_playlists);
        assert_eq!(
            settings.list_file,
            PathBuf::from("/project/lists/playlists.txt")
        );
        assert_eq!(settings.extraction_timeout, Some(Duration::from_secs(600)));
        assert!(settings.logging.file);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn override_precedence_beats_env_and_file() {
        let cfg = make_config("output_dir = \"/file\"\nnum_workers = 3\nvideo_quality = \"480p\"\n");
        let file = read_config_file(cfg.path()).unwrap();
        let settings = build_settings_with_overrides(
            &file,
            Path::new("/project"),
            |key| match key {
                "BULKTUBE_OUTPUT_DIR" => Some("/env".to_string()),
                "BULKTUBE_NUM_WORKERS" => Some("8".to_string()),
                _ => None,
            },
            SettingsOverrides {
                video_quality: Some("1080p".into()),
                list_file: Some(PathBuf::from("urls.txt")),
                ..SettingsOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.output_dir, PathBuf::from("/env"));
        assert_eq!(settings.num_workers, 8);
        assert_eq!(settings.quality, Quality::MaxHeight(1080));
        assert_eq!(settings.list_file, PathBuf::from("urls.txt"));
    }

    #[test]
    fn invalid_env_workers_falls_back_to_file() {
        let cfg = make_config("num_workers = 3\n");
        let file = read_config_file(cfg.path()).unwrap();
        let settings = build_settings_with_overrides(
            &file,
            Path::new(""),
            |key| (key == "BULKTUBE_NUM_WORKERS").then(|| "many".to_string()),
            SettingsOverrides::default(),
        )
        .unwrap();
        assert_eq!(settings.num_workers, 3);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cfg = make_config("num_workers = 0\n");
        let file = read_config_file(cfg.path()).unwrap();
        let err = build_settings_with_overrides(
            &file,
            Path::new(""),
            |_| None,
            SettingsOverrides::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("num_workers"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let cfg = make_config("output_directory = \"/x\"\n");
        assert!(read_config_file(cfg.path()).is_err());
    }

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = read_config_file(&dir.path().join("missing.toml")).unwrap();
        assert!(file.output_dir.is_none());
        assert!(file.logging.level.is_none());
    }
}
