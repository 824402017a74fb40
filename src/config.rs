//! Runtime settings, resolved from command-line overrides, then the process
//! environment, then a `.env` file, then defaults.

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::logging::LogFormat;
use crate::scheduler::{DEFAULT_SYNC_HOURS, ScheduleConfig};
use crate::sync::{DEFAULT_HIGHLIGHT_COUNT, SyncOptions};
use crate::youtube::{DEFAULT_API_BASE_URL, YouTubeConfig};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATABASE_PATH: &str = "data/channelsite.db";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_INITIAL_SYNC_DELAY_SECS: u64 = 30;
pub const DEFAULT_HEALTH_CHECK_MINUTES: u64 = 30;

#[derive(Clone)]
pub struct Settings {
    pub api_key: String,
    pub channel_id: String,
    pub api_base_url: String,
    pub http_timeout: Duration,
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub sync_hours: Vec<u32>,
    pub initial_sync_delay: Duration,
    pub health_check_interval: Duration,
    pub highlight_count: usize,
    pub log_format: LogFormat,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &"<redacted>")
            .field("channel_id", &self.channel_id)
            .field("api_base_url", &self.api_base_url)
            .field("http_timeout", &self.http_timeout)
            .field("database_path", &self.database_path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("sync_hours", &self.sync_hours)
            .field("initial_sync_delay", &self.initial_sync_delay)
            .field("health_check_interval", &self.health_check_interval)
            .field("highlight_count", &self.highlight_count)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Settings {
    pub fn youtube(&self) -> YouTubeConfig {
        YouTubeConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            channel_id: self.channel_id.clone(),
            timeout: self.http_timeout,
        }
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            sync_hours: self.sync_hours.clone(),
            initial_delay: self.initial_sync_delay,
            health_check_interval: self.health_check_interval,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            highlight_count: self.highlight_count,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Values supplied on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub env_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub channel_id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
}

pub fn load_settings() -> Result<Settings> {
    resolve_settings(SettingsOverrides::default())
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let number = |key: &str, default: u64| {
        lookup(key)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(default)
    };

    let api_key = lookup("YOUTUBE_API_KEY").ok_or_else(|| anyhow!("YOUTUBE_API_KEY not set"))?;
    let channel_id = non_blank(overrides.channel_id)
        .or_else(|| lookup("YOUTUBE_CHANNEL_ID"))
        .ok_or_else(|| anyhow!("YOUTUBE_CHANNEL_ID not set"))?;
    let api_base_url =
        lookup("YOUTUBE_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let database_path = overrides
        .database_path
        .or_else(|| lookup("DATABASE_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    let host = non_blank(overrides.host)
        .or_else(|| lookup("CHANNELSITE_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("CHANNELSITE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let sync_hours = match lookup("SYNC_HOURS") {
        Some(raw) => parse_sync_hours(&raw).context("invalid SYNC_HOURS")?,
        None => DEFAULT_SYNC_HOURS.to_vec(),
    };
    let log_format = match overrides.log_format {
        Some(format) => format,
        None => lookup("LOG_FORMAT")
            .and_then(|value| value.parse().ok())
            .unwrap_or_default(),
    };

    Ok(Settings {
        api_key,
        channel_id,
        api_base_url,
        http_timeout: Duration::from_secs(
            number("YOUTUBE_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS).max(1),
        ),
        database_path,
        host,
        port,
        sync_hours,
        initial_sync_delay: Duration::from_secs(number(
            "INITIAL_SYNC_DELAY_SECS",
            DEFAULT_INITIAL_SYNC_DELAY_SECS,
        )),
        health_check_interval: Duration::from_secs(
            number("HEALTH_CHECK_MINUTES", DEFAULT_HEALTH_CHECK_MINUTES).max(1) * 60,
        ),
        highlight_count: number("HIGHLIGHT_COUNT", DEFAULT_HIGHLIGHT_COUNT as u64) as usize,
        log_format,
    })
}

/// Parses a comma-separated list of hours of the day, e.g. `6,18`.
pub fn parse_sync_hours(raw: &str) -> Result<Vec<u32>> {
    let mut hours = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let hour: u32 = part
            .parse()
            .with_context(|| format!("{part:?} is not an hour"))?;
        if hour > 23 {
            bail!("hour {hour} is out of range 0-23");
        }
        if !hours.contains(&hour) {
            hours.push(hour);
        }
    }
    if hours.is_empty() {
        bail!("no sync hours given");
    }
    hours.sort_unstable();
    Ok(hours)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

/// Reads `KEY=value` lines. Comments, blank lines and lines without `=` are
/// skipped; an `export ` prefix and matching quotes are stripped. A missing
/// file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const REQUIRED: &str = "YOUTUBE_API_KEY=\"k\"\nYOUTUBE_CHANNEL_ID=\"UC1\"\n";

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None).unwrap()
    }

    #[test]
    fn defaults_fill_everything_but_credentials() {
        let settings = settings_from(REQUIRED);
        assert_eq!(settings.api_key, "k");
        assert_eq!(settings.channel_id, "UC1");
        assert_eq!(settings.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(settings.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(settings.bind_address(), "127.0.0.1:8080");
        assert_eq!(settings.sync_hours, vec![6, 18]);
        assert_eq!(settings.http_timeout, Duration::from_secs(30));
        assert_eq!(settings.initial_sync_delay, Duration::from_secs(30));
        assert_eq!(settings.health_check_interval, Duration::from_secs(30 * 60));
        assert_eq!(settings.highlight_count, 8);
        assert_eq!(settings.log_format, LogFormat::Text);

        let schedule = settings.schedule();
        assert_eq!(schedule.sync_hours, DEFAULT_SYNC_HOURS.to_vec());
        assert_eq!(schedule.initial_delay, settings.initial_sync_delay);
        assert_eq!(schedule.health_check_interval, settings.health_check_interval);
        assert_eq!(settings.youtube().timeout, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
    }

    #[test]
    fn missing_credentials_are_errors() {
        let vars = read_env_file(make_config("YOUTUBE_CHANNEL_ID=UC1\n").path()).unwrap();
        let err = build_settings(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("YOUTUBE_API_KEY"));

        let vars = read_env_file(make_config("YOUTUBE_API_KEY=k\n").path()).unwrap();
        let err = build_settings(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("YOUTUBE_CHANNEL_ID"));
    }

    #[test]
    fn file_values_are_parsed() {
        let settings = settings_from(&format!(
            "{REQUIRED}SYNC_HOURS=\"18, 6,12\"\nHEALTH_CHECK_MINUTES=5\nHIGHLIGHT_COUNT=4\n\
             CHANNELSITE_PORT=9090\nLOG_FORMAT=json\nDATABASE_PATH=/var/lib/site.db\n"
        ));
        assert_eq!(settings.sync_hours, vec![6, 12, 18]);
        assert_eq!(settings.health_check_interval, Duration::from_secs(300));
        assert_eq!(settings.highlight_count, 4);
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.database_path, PathBuf::from("/var/lib/site.db"));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from(&format!(
            "{REQUIRED}CHANNELSITE_PORT=nope\nINITIAL_SYNC_DELAY_SECS=-3\nLOG_FORMAT=xml\n"
        ));
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.initial_sync_delay, Duration::from_secs(30));
        assert_eq!(settings.log_format, LogFormat::Text);
    }

    #[test]
    fn invalid_sync_hours_are_rejected() {
        let vars = read_env_file(make_config(&format!("{REQUIRED}SYNC_HOURS=6,25\n")).path())
            .unwrap();
        assert!(build_settings(&vars, |_| None).is_err());
        assert!(parse_sync_hours(" , ").is_err());
        assert!(parse_sync_hours("six").is_err());
        assert_eq!(parse_sync_hours("0,23,0").unwrap(), vec![0, 23]);
    }

    #[test]
    fn env_wins_over_file_and_overrides_win_over_env() {
        let vars = read_env_file(
            make_config(&format!("{REQUIRED}CHANNELSITE_HOST=file-host\nCHANNELSITE_PORT=7000\n"))
                .path(),
        )
        .unwrap();
        let env = |key: &str| match key {
            "YOUTUBE_CHANNEL_ID" => Some("UC-env".to_string()),
            "CHANNELSITE_PORT" => Some("8000".to_string()),
            _ => None,
        };

        let settings = build_settings(&vars, env).unwrap();
        assert_eq!(settings.channel_id, "UC-env");
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.host, "file-host");

        let settings = build_settings_with_overrides(
            &vars,
            env,
            SettingsOverrides {
                channel_id: Some("UC-cli".into()),
                port: Some(9000),
                host: Some("   ".into()),
                database_path: Some(PathBuf::from("/tmp/cli.db")),
                ..SettingsOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.channel_id, "UC-cli");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host, "file-host", "blank override is ignored");
        assert_eq!(settings.database_path, PathBuf::from("/tmp/cli.db"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export YOUTUBE_API_KEY="abc"
            YOUTUBE_CHANNEL_ID='UC9'
            CHANNELSITE_HOST =  "0.0.0.0"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("YOUTUBE_API_KEY").unwrap(), "abc");
        assert_eq!(vars.get("YOUTUBE_CHANNEL_ID").unwrap(), "UC9");
        assert_eq!(vars.get("CHANNELSITE_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn debug_output_hides_the_api_key() {
        let settings = settings_from("YOUTUBE_API_KEY=super-secret\nYOUTUBE_CHANNEL_ID=UC1\n");
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("UC1"));
        assert!(!format!("{:?}", settings.youtube()).contains("super-secret"));
    }
}
