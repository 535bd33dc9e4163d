use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use crate::{errors::Error, quiet::QuietHours, Result};

pub const DEFAULT_DATA_DIR: &str = "/app/data";
pub const DEFAULT_IMAP_HOST: &str = "imap.yandex.ru";
pub const DEFAULT_JIRA_HOST: &str = "jira.task-cloud.ru";
pub const DEFAULT_REDIRECT_BIND: &str = "0.0.0.0:8000";

const MIN_CHECK_INTERVAL_SECS: u64 = 5;

/// Typed configuration shared by the bot and the redirect server.
///
/// Both processes read the same `.env` file; each binary checks the settings
/// it actually needs (`require_bot_token`, `require_oauth`).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub bot_token: Option<String>,
    pub telegram_message_limit: usize,

    // Storage
    pub data_dir: PathBuf,
    pub user_config_file: PathBuf,

    // Mail polling
    pub check_interval: Duration,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_timeout: Duration,
    pub catchup_window: Duration,

    // Jira + delivery
    pub jira_host: String,
    pub quiet_hours: QuietHours,

    // OAuth
    pub oauth: Option<OAuthConfig>,
    pub redirect_bind: SocketAddr,
}

/// Yandex OAuth application settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub oauth_base_url: String,
    pub info_url: String,
}

impl Config {
    /// Load from the process environment, reading `.env` first when present.
    ///
    /// Variables already set in the environment are never overridden.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(Error::Config(format!("failed to read .env: {e}"))),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (tests use a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let bot_token = get("BOT_TOKEN");
        let telegram_message_limit = parse_or(get("TELEGRAM_MESSAGE_LIMIT"), 4096usize);

        let data_dir = PathBuf::from(get("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into()));
        let user_config_file = get("USER_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("user_config.json"));

        let check_interval = Duration::from_secs(
            parse_or(get("CHECK_INTERVAL"), 60u64).max(MIN_CHECK_INTERVAL_SECS),
        );
        let imap_host = get("IMAP_HOST").unwrap_or_else(|| DEFAULT_IMAP_HOST.into());
        let imap_port = parse_or(get("IMAP_PORT"), 993u16);
        let imap_timeout = Duration::from_secs(parse_or(get("IMAP_TIMEOUT"), 30u64).max(1));
        let catchup_window = Duration::from_secs(
            parse_or(get("CATCHUP_WINDOW_MINUTES"), 15u64).saturating_mul(60),
        );

        let jira_host = get("JIRA_HOST").unwrap_or_else(|| DEFAULT_JIRA_HOST.into());

        let quiet_hours = QuietHours {
            utc_offset_hours: parse_or(get("QUIET_UTC_OFFSET_HOURS"), 3i32),
            start_hour: parse_or(get("WORK_HOURS_START"), 9u32),
            end_hour: parse_or(get("WORK_HOURS_END"), 18u32),
        };
        if quiet_hours.utc_offset_hours.abs() > 14 {
            return Err(Error::Config(format!(
                "QUIET_UTC_OFFSET_HOURS out of range: {}",
                quiet_hours.utc_offset_hours
            )));
        }
        if quiet_hours.start_hour > 24 || quiet_hours.end_hour > 24 {
            return Err(Error::Config(
                "WORK_HOURS_START/WORK_HOURS_END must be within 0..=24".to_string(),
            ));
        }

        let oauth = match (
            get("YANDEX_CLIENT_ID"),
            get("YANDEX_CLIENT_SECRET"),
            get("YANDEX_REDIRECT_URI"),
        ) {
            (Some(client_id), Some(client_secret), Some(redirect_uri)) => Some(OAuthConfig {
                client_id,
                client_secret,
                redirect_uri,
                oauth_base_url: get("YANDEX_OAUTH_URL")
                    .unwrap_or_else(|| "https://oauth.yandex.ru".into())
                    .trim_end_matches('/')
                    .to_string(),
                info_url: get("YANDEX_INFO_URL")
                    .unwrap_or_else(|| "https://login.yandex.ru/info?format=json".into()),
            }),
            _ => None,
        };

        let bind_raw = get("REDIRECT_BIND").unwrap_or_else(|| DEFAULT_REDIRECT_BIND.into());
        let redirect_bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("invalid REDIRECT_BIND {bind_raw:?}: {e}")))?;

        Ok(Self {
            bot_token,
            telegram_message_limit,
            data_dir,
            user_config_file,
            check_interval,
            imap_host,
            imap_port,
            imap_timeout,
            catchup_window,
            jira_host,
            quiet_hours,
            oauth,
            redirect_bind,
        })
    }

    pub fn require_bot_token(&self) -> Result<&str> {
        self.bot_token.as_deref().ok_or_else(|| {
            Error::Config("BOT_TOKEN environment variable is required".to_string())
        })
    }

    pub fn require_oauth(&self) -> Result<&OAuthConfig> {
        self.oauth.as_ref().ok_or_else(|| {
            Error::Config(
                "YANDEX_CLIENT_ID, YANDEX_CLIENT_SECRET and YANDEX_REDIRECT_URI are required"
                    .to_string(),
            )
        })
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}
