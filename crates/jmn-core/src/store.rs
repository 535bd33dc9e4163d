//! Per-user settings persisted as one JSON file in the shared data directory.
//!
//! The bot and the redirect server both write this file, so every mutation
//! re-reads it from disk first and saves it back with an atomic rename.
//! Records this version cannot read are carried through saves untouched.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::UserId,
    errors::Error,
    jira::{EventSet, JiraEvent},
    mailbox::{AuthMethod, Credentials},
    Result,
};

/// Stored mailbox settings. `password` holds either an app password or an
/// OAuth access token depending on `auth`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_imap_host")]
    pub host: String,
    #[serde(default)]
    pub auth: AuthMethod,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JiraNotifications {
    pub created: bool,
    pub assigned: bool,
    pub update: bool,
    pub comment: bool,
    pub mention_description: bool,
    pub mention_comment: bool,
    pub worklog: bool,
}

impl Default for JiraNotifications {
    fn default() -> Self {
        Self {
            created: true,
            assigned: true,
            update: true,
            comment: true,
            mention_description: true,
            mention_comment: true,
            worklog: false,
        }
    }
}

impl JiraNotifications {
    pub fn get(&self, event: JiraEvent) -> bool {
        match event {
            JiraEvent::Created => self.created,
            JiraEvent::Assigned => self.assigned,
            JiraEvent::Update => self.update,
            JiraEvent::Comment => self.comment,
            JiraEvent::MentionDescription => self.mention_description,
            JiraEvent::MentionComment => self.mention_comment,
            JiraEvent::Worklog => self.worklog,
        }
    }

    pub fn set(&mut self, event: JiraEvent, on: bool) {
        let slot = match event {
            JiraEvent::Created => &mut self.created,
            JiraEvent::Assigned => &mut self.assigned,
            JiraEvent::Update => &mut self.update,
            JiraEvent::Comment => &mut self.comment,
            JiraEvent::MentionDescription => &mut self.mention_description,
            JiraEvent::MentionComment => &mut self.mention_comment,
            JiraEvent::Worklog => &mut self.worklog,
        };
        *slot = on;
    }

    /// Event types the user wants to hear about.
    pub fn enabled(&self) -> EventSet {
        JiraEvent::MENU_ORDER
            .into_iter()
            .filter(|e| self.get(*e))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub jira: JiraNotifications,
    /// Announce non-Jira mail.
    #[serde(default)]
    pub mail: bool,
    /// Deliver silently outside working hours.
    #[serde(default = "default_true")]
    pub quiet_notifications: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            jira: JiraNotifications::default(),
            mail: false,
            quiet_notifications: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub email: EmailSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub last_uid: Option<u32>,
    #[serde(with = "local_iso")]
    pub last_check_time: NaiveDateTime,
}

impl UserConfig {
    pub fn new(default_host: &str, now: NaiveDateTime) -> Self {
        Self {
            email: EmailSettings {
                value: None,
                password: None,
                host: default_host.to_string(),
                auth: AuthMethod::Password,
            },
            notifications: NotificationSettings::default(),
            last_uid: None,
            last_check_time: now,
        }
    }

    /// Credentials usable for IMAP, if both address and secret are set.
    pub fn credentials(&self) -> Option<Credentials> {
        let email = self.email.value.as_deref().filter(|s| !s.is_empty())?;
        let secret = self.email.password.as_deref().filter(|s| !s.is_empty())?;
        Some(Credentials {
            host: self.email.host.clone(),
            email: email.to_string(),
            secret: secret.to_string(),
            auth: self.email.auth,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials().is_some()
    }
}

type UserConfigs = BTreeMap<String, UserConfig>;

/// In-memory image of the store file.
#[derive(Debug, Default)]
struct StoreFile {
    users: UserConfigs,
    /// Records that failed to deserialize, written back as they were read.
    unreadable: BTreeMap<String, Value>,
}

impl StoreFile {
    fn entry(&mut self, key: String, default_host: &str) -> &mut UserConfig {
        if self.unreadable.remove(&key).is_some() {
            tracing::warn!(user = %key, "replacing unreadable user record with defaults");
        }
        self.users
            .entry(key)
            .or_insert_with(|| UserConfig::new(default_host, now_local()))
    }
}

pub struct UserStore {
    path: PathBuf,
    default_host: String,
    file: Mutex<StoreFile>,
}

impl UserStore {
    /// Open (or lazily create) the store file. The parent directory is created.
    pub fn open(path: impl Into<PathBuf>, default_host: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = load_file(&path)?;
        tracing::info!(
            path = %path.display(),
            users = file.users.len(),
            unreadable = file.unreadable.len(),
            "user store loaded"
        );
        Ok(Self {
            path,
            default_host: default_host.into(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    fn locked_fresh(&self) -> Result<MutexGuard<'_, StoreFile>> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        *guard = load_file(&self.path)?;
        Ok(guard)
    }

    /// Snapshot of all users with a numeric id.
    pub fn users(&self) -> Result<Vec<(UserId, UserConfig)>> {
        let guard = self.locked_fresh()?;
        Ok(guard
            .users
            .iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|id| (UserId(id), v.clone())))
            .collect())
    }

    pub fn get(&self, user: UserId) -> Result<Option<UserConfig>> {
        let guard = self.locked_fresh()?;
        Ok(guard.users.get(&user.to_string()).cloned())
    }

    /// Create the default record for `user` if it does not exist yet.
    pub fn ensure_user(&self, user: UserId) -> Result<UserConfig> {
        let mut guard = self.locked_fresh()?;
        let key = user.to_string();
        if let Some(existing) = guard.users.get(&key) {
            return Ok(existing.clone());
        }
        let cfg = guard.entry(key, &self.default_host).clone();
        save_file(&self.path, &guard)?;
        tracing::info!(user_id = user.0, "created user record");
        Ok(cfg)
    }

    /// Read-modify-write one user record (created with defaults if missing).
    pub fn update<T>(&self, user: UserId, f: impl FnOnce(&mut UserConfig) -> T) -> Result<T> {
        let mut guard = self.locked_fresh()?;
        let out = f(guard.entry(user.to_string(), &self.default_host));
        save_file(&self.path, &guard)?;
        Ok(out)
    }

    pub fn set_email_credentials(
        &self,
        user: UserId,
        email: &str,
        secret: &str,
        auth: AuthMethod,
    ) -> Result<()> {
        self.update(user, |cfg| {
            cfg.email.value = Some(email.to_string());
            cfg.email.password = Some(secret.to_string());
            cfg.email.auth = auth;
        })
    }

    pub fn clear_email_credentials(&self, user: UserId) -> Result<()> {
        self.update(user, |cfg| {
            cfg.email.value = None;
            cfg.email.password = None;
        })
    }

    /// `None` when the user is unknown or has no mailbox configured.
    pub fn email_credentials(&self, user: UserId) -> Result<Option<Credentials>> {
        Ok(self.get(user)?.and_then(|cfg| cfg.credentials()))
    }

    pub fn set_jira_notification(&self, user: UserId, event: JiraEvent, on: bool) -> Result<()> {
        self.update(user, |cfg| cfg.notifications.jira.set(event, on))
    }

    /// Flip one Jira event flag; returns the new value.
    pub fn toggle_jira_notification(&self, user: UserId, event: JiraEvent) -> Result<bool> {
        self.update(user, |cfg| {
            let next = !cfg.notifications.jira.get(event);
            cfg.notifications.jira.set(event, next);
            next
        })
    }

    /// Flip the non-Jira mail flag; returns the new value.
    pub fn toggle_mail_notifications(&self, user: UserId) -> Result<bool> {
        self.update(user, |cfg| {
            cfg.notifications.mail = !cfg.notifications.mail;
            cfg.notifications.mail
        })
    }

    /// Flip the quiet-hours flag; returns the new value.
    pub fn toggle_quiet_notifications(&self, user: UserId) -> Result<bool> {
        self.update(user, |cfg| {
            cfg.notifications.quiet_notifications = !cfg.notifications.quiet_notifications;
            cfg.notifications.quiet_notifications
        })
    }

    pub fn notifications(&self, user: UserId) -> Result<NotificationSettings> {
        Ok(self.ensure_user(user)?.notifications)
    }

    pub fn record_uid(&self, user: UserId, uid: u32) -> Result<()> {
        self.update(user, |cfg| cfg.last_uid = Some(uid))
    }

    pub fn record_check_time(&self, user: UserId, at: NaiveDateTime) -> Result<()> {
        self.update(user, |cfg| cfg.last_check_time = at)
    }
}

/// Local wall-clock time with microsecond precision (the stored format).
pub fn now_local() -> NaiveDateTime {
    let now = Local::now().naive_local();
    let micros = now.nanosecond() / 1_000 * 1_000;
    now.with_nanosecond(micros).unwrap_or(now)
}

fn default_imap_host() -> String {
    crate::config::DEFAULT_IMAP_HOST.to_string()
}

fn default_true() -> bool {
    true
}

fn load_file(path: &Path) -> Result<StoreFile> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreFile::default()),
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Ok(StoreFile::default());
    }
    parse_users(&raw, now_local())
}

/// Each write goes to its own temp file in the target directory, so
/// concurrent writers never rename each other's half-written output.
fn save_file(path: &Path, file: &StoreFile) -> Result<()> {
    let mut root = serde_json::Map::new();
    for (key, raw) in &file.unreadable {
        root.insert(key.clone(), raw.clone());
    }
    for (key, cfg) in &file.users {
        root.insert(key.clone(), serde_json::to_value(cfg)?);
    }
    let txt = serde_json::to_string_pretty(&Value::Object(root))?;

    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(txt.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Parse the store file, upgrading older record shapes.
fn parse_users(raw: &str, now: NaiveDateTime) -> Result<StoreFile> {
    let root: Value = serde_json::from_str(raw)?;
    let Value::Object(map) = root else {
        return Err(Error::Config(
            "user config file must contain a JSON object".to_string(),
        ));
    };

    let mut file = StoreFile::default();
    for (key, original) in map {
        let mut record = original.clone();
        normalize_record(&mut record, now);
        match serde_json::from_value::<UserConfig>(record) {
            Ok(cfg) => {
                file.users.insert(key, cfg);
            }
            Err(e) => {
                tracing::warn!(user = %key, "keeping unreadable user record as is: {e}");
                file.unreadable.insert(key, original);
            }
        }
    }
    Ok(file)
}

fn normalize_record(record: &mut Value, now: NaiveDateTime) {
    let Some(obj) = record.as_object_mut() else {
        return;
    };

    // Flat records: {"email": "a@b", "password": "..."} from the first bot version.
    if let Some(Value::String(addr)) = obj.get("email").cloned() {
        let password = obj.remove("password").unwrap_or(Value::Null);
        obj.insert(
            "email".to_string(),
            serde_json::json!({
                "value": addr,
                "password": password,
                "host": default_imap_host(),
                "auth": "password",
            }),
        );
    }

    let last_uid = match obj.get("last_uid") {
        Some(Value::String(s)) => s.trim().parse::<u32>().ok().map(Value::from),
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()).map(Value::from),
        _ => None,
    };
    obj.insert("last_uid".to_string(), last_uid.unwrap_or(Value::Null));

    let check_time_ok = obj
        .get("last_check_time")
        .and_then(Value::as_str)
        .map(|s| local_iso::parse(s).is_some())
        .unwrap_or(false);
    if !check_time_ok {
        obj.insert(
            "last_check_time".to_string(),
            Value::String(local_iso::format(&now)),
        );
    }
}

/// ISO-8601 local timestamps without offset, microsecond precision.
mod local_iso {
    use chrono::NaiveDateTime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn format(dt: &NaiveDateTime) -> String {
        dt.format(FORMAT).to_string()
    }

    pub fn parse(s: &str) -> Option<NaiveDateTime> {
        let s = s.trim();
        s.parse::<NaiveDateTime>()
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").ok())
    }

    pub fn serialize<S: Serializer>(dt: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn tmp_store(prefix: &str) -> (PathBuf, UserStore) {
        let dir = std::env::temp_dir().join(format!(
            "jmn-store-{prefix}-{}-{}",
            std::process::id(),
            Local::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("user_config.json");
        let store = UserStore::open(&path, "imap.yandex.ru").unwrap();
        (dir, store)
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 20)
            .unwrap()
            .and_hms_micro_opt(h, m, 0, 123_456)
            .unwrap()
    }

    #[test]
    fn ensure_user_creates_defaults_and_persists() {
        let (dir, store) = tmp_store("defaults");
        let cfg = store.ensure_user(UserId(42)).unwrap();

        assert_eq!(cfg.email.host, "imap.yandex.ru");
        assert!(cfg.email.value.is_none());
        assert!(cfg.notifications.jira.created);
        assert!(!cfg.notifications.jira.worklog);
        assert!(!cfg.notifications.mail);
        assert!(cfg.notifications.quiet_notifications);
        assert_eq!(cfg.last_uid, None);

        let raw = fs::read_to_string(store.path()).unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["42"]["notifications"]["jira"]["worklog"], Value::Bool(false));
        assert_eq!(v["42"]["last_uid"], Value::Null);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn credentials_round_trip_and_clear() {
        let (dir, store) = tmp_store("creds");
        let user = UserId(7);
        assert!(store.email_credentials(user).unwrap().is_none());

        store
            .set_email_credentials(user, "me@yandex.ru", "token", AuthMethod::OAuth)
            .unwrap();
        let creds = store.email_credentials(user).unwrap().unwrap();
        assert_eq!(creds.email, "me@yandex.ru");
        assert_eq!(creds.secret, "token");
        assert_eq!(creds.host, "imap.yandex.ru");
        assert_eq!(creds.auth, AuthMethod::OAuth);

        store.clear_email_credentials(user).unwrap();
        assert!(store.email_credentials(user).unwrap().is_none());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn toggles_flip_and_return_new_value() {
        let (dir, store) = tmp_store("toggles");
        let user = UserId(1);
        assert!(store.toggle_mail_notifications(user).unwrap());
        assert!(!store.toggle_mail_notifications(user).unwrap());
        assert!(!store.toggle_quiet_notifications(user).unwrap());
        assert!(store.toggle_jira_notification(user, JiraEvent::Worklog).unwrap());

        store
            .set_jira_notification(user, JiraEvent::Created, false)
            .unwrap();
        let n = store.notifications(user).unwrap();
        assert!(!n.jira.created);
        assert!(n.jira.worklog);
        assert!(!n.quiet_notifications);
        assert!(!n.jira.enabled().contains(&JiraEvent::Created));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn writes_from_another_process_are_picked_up() {
        let (dir, store) = tmp_store("shared");
        store.ensure_user(UserId(5)).unwrap();

        // A second handle on the same file plays the redirect server.
        let other = UserStore::open(store.path(), "imap.yandex.ru").unwrap();
        other
            .set_email_credentials(UserId(5), "a@b.ru", "t", AuthMethod::OAuth)
            .unwrap();

        store.toggle_mail_notifications(UserId(5)).unwrap();
        let cfg = store.get(UserId(5)).unwrap().unwrap();
        assert_eq!(cfg.email.value.as_deref(), Some("a@b.ru"));
        assert!(cfg.notifications.mail);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn legacy_records_are_normalized() {
        let now = at(12, 0);
        let raw = r#"{
            "1": {"email": "old@yandex.ru", "password": "app-pass", "last_uid": "17"},
            "2": {
                "email": {"value": "x@y.ru", "password": "tok", "host": "imap.yandex.ru"},
                "notifications": {"jira": {"created": false}, "mail": true},
                "last_uid": "null",
                "last_check_time": "2025-03-19T08:30:00.5"
            },
            "3": {"email": {"value": null, "password": null}, "last_uid": "abc"}
        }"#;
        let users = parse_users(raw, now).unwrap().users;

        let u1 = &users["1"];
        assert_eq!(u1.email.value.as_deref(), Some("old@yandex.ru"));
        assert_eq!(u1.email.password.as_deref(), Some("app-pass"));
        assert_eq!(u1.email.auth, AuthMethod::Password);
        assert_eq!(u1.last_uid, Some(17));
        assert_eq!(u1.last_check_time, now);

        let u2 = &users["2"];
        assert_eq!(u2.email.auth, AuthMethod::OAuth);
        assert_eq!(u2.last_uid, None);
        assert!(!u2.notifications.jira.created);
        assert!(u2.notifications.jira.assigned);
        assert!(u2.notifications.mail);
        assert!(u2.notifications.quiet_notifications);
        assert_eq!(
            u2.last_check_time,
            NaiveDate::from_ymd_opt(2025, 3, 19)
                .unwrap()
                .and_hms_milli_opt(8, 30, 0, 500)
                .unwrap()
        );

        let u3 = &users["3"];
        assert_eq!(u3.last_uid, None);
        assert_eq!(u3.email.host, "imap.yandex.ru");
        assert!(!u3.has_credentials());
    }

    #[test]
    fn check_time_is_stored_with_microseconds() {
        let (dir, store) = tmp_store("time");
        store.record_check_time(UserId(3), at(9, 15)).unwrap();
        store.record_uid(UserId(3), 99).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["3"]["last_check_time"], "2025-03-20T09:15:00.123456");
        assert_eq!(v["3"]["last_uid"], 99);
        assert!(raw.contains("\n  \"3\": {"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unreadable_records_survive_other_writes() {
        let (dir, store) = tmp_store("unreadable");
        fs::write(
            store.path(),
            r#"{"9": {"notifications": {"mail": true}, "last_uid": 77}, "10": "garbage"}"#,
        )
        .unwrap();

        store.ensure_user(UserId(1)).unwrap();
        store.record_uid(UserId(1), 5).unwrap();

        let v: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(v["9"], serde_json::json!({"notifications": {"mail": true}, "last_uid": 77}));
        assert_eq!(v["10"], "garbage");
        assert_eq!(v["1"]["last_uid"], 5);

        let ids: Vec<i64> = store.users().unwrap().into_iter().map(|(u, _)| u.0).collect();
        assert_eq!(ids, vec![1]);

        // Opening the menu replaces the broken record with a fresh one.
        let fresh = store.ensure_user(UserId(9)).unwrap();
        assert_eq!(fresh.last_uid, None);
        let v: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(v["9"]["email"].is_object());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn concurrent_writers_on_one_file_do_not_fail() {
        let (dir, store) = tmp_store("concurrent");
        let path = store.path().to_path_buf();

        let writers: Vec<_> = [1i64, 2]
            .into_iter()
            .map(|id| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let own = UserStore::open(&path, "imap.yandex.ru").unwrap();
                    for uid in 1..=300u32 {
                        own.record_uid(UserId(id), uid)?;
                    }
                    Ok::<_, Error>(())
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap().unwrap();
        }

        // The file is always a complete document, and no temp files are left behind.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<Value>(&raw).is_ok());
        let leftovers = fs::read_dir(&dir).unwrap().count();
        assert_eq!(leftovers, 1);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn non_object_file_is_an_error() {
        assert!(matches!(parse_users("[]", at(0, 0)), Err(Error::Config(_))));
    }
}
