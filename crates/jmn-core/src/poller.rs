//! Periodic mailbox poller.
//!
//! Every `check_interval` the poller walks all stored users concurrently,
//! pulls new inbox messages through the `MailboxPort`, turns Jira emails into
//! condensed summaries and delivers them through the `MessagingPort`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::{task::JoinHandle, task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    domain::UserId,
    formatting::new_mail_notification,
    jira::JiraParser,
    mailbox::MailboxPort,
    messaging::{port::MessagingPort, types::SendOptions},
    quiet::QuietHours,
    store::{now_local, UserConfig, UserStore},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct PollerSettings {
    pub interval: Duration,
    /// Longest look-back after a gap (restart, outage).
    pub catchup_window: Duration,
    pub quiet_hours: QuietHours,
}

impl From<&Config> for PollerSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            interval: cfg.check_interval,
            catchup_window: cfg.catchup_window,
            quiet_hours: cfg.quiet_hours,
        }
    }
}

#[derive(Clone)]
pub struct MailPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    settings: PollerSettings,
    jira: JiraParser,
    store: Arc<UserStore>,
    mailbox: Arc<dyn MailboxPort>,
    messenger: Arc<dyn MessagingPort>,
    pass_running: AtomicBool,
}

/// Outcome of one user's check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub fetched: usize,
    pub delivered: usize,
}

impl MailPoller {
    pub fn new(
        settings: PollerSettings,
        jira: JiraParser,
        store: Arc<UserStore>,
        mailbox: Arc<dyn MailboxPort>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                settings,
                jira,
                store,
                mailbox,
                messenger,
                pass_running: AtomicBool::new(false),
            }),
        }
    }

    /// Run passes every interval until `cancel` fires. The first pass happens
    /// one interval after start.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(poller.inner.settings.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick.tick().await;
            tracing::info!(
                interval_secs = poller.inner.settings.interval.as_secs(),
                "mail poller started"
            );

            loop {
                tokio::select! {
                  _ = cancel.cancelled() => break,
                  _ = tick.tick() => {
                    let poller = poller.clone();
                    tokio::spawn(async move { poller.check_all_users().await; });
                  }
                }
            }
            tracing::info!("mail poller stopped");
        })
    }

    /// One pass over every stored user. Returns how many users were checked;
    /// zero when a previous pass is still running.
    pub async fn check_all_users(&self) -> usize {
        if self.inner.pass_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("previous mail check still running, skipping this pass");
            return 0;
        }

        tracing::info!("mail check pass started");
        let users = match self.inner.store.users() {
            Ok(u) => u,
            Err(e) => {
                tracing::error!("failed to read user store: {e}");
                self.inner.pass_running.store(false, Ordering::SeqCst);
                return 0;
            }
        };

        let mut tasks = JoinSet::new();
        for (user, cfg) in users {
            let poller = self.clone();
            tasks.spawn(async move {
                if let Err(e) = poller.check_user(user, cfg).await {
                    tracing::error!(user_id = user.0, "mail check failed: {e}");
                }
            });
        }

        let mut checked = 0usize;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!("mail check task panicked: {e}");
            }
            checked += 1;
        }

        tracing::info!(users = checked, "mail check pass finished");
        self.inner.pass_running.store(false, Ordering::SeqCst);
        checked
    }

    pub async fn check_user(&self, user: UserId, cfg: UserConfig) -> Result<CheckReport> {
        self.check_user_at(user, cfg, now_local(), Utc::now()).await
    }

    /// `now_local` drives the stored check time and the IMAP date;
    /// `now_utc` drives quiet hours.
    pub async fn check_user_at(
        &self,
        user: UserId,
        cfg: UserConfig,
        now_local: NaiveDateTime,
        now_utc: DateTime<Utc>,
    ) -> Result<CheckReport> {
        let Some(creds) = cfg.credentials() else {
            return Ok(CheckReport::default());
        };
        let settings = &self.inner.settings;

        tracing::info!(user_id = user.0, email = %creds.email, "checking mailbox");

        let window = chrono::Duration::from_std(settings.catchup_window)
            .unwrap_or(chrono::Duration::MAX);
        let mut since = cfg.last_check_time;
        if now_local - since > window {
            since = now_local - window;
        }
        let after_uid = cfg.last_uid.filter(|uid| *uid > 0);

        let mails = match self
            .inner
            .mailbox
            .fetch_since(&creds, since.date(), after_uid)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(user_id = user.0, "imap error: {e}");
                Vec::new()
            }
        };
        tracing::info!(user_id = user.0, found = mails.len(), since = %since.date(), "new messages");

        let allowed = cfg.notifications.jira.enabled();
        let opts = SendOptions::silent(
            settings
                .quiet_hours
                .silent(cfg.notifications.quiet_notifications, now_utc),
        );

        let mut report = CheckReport {
            fetched: mails.len(),
            delivered: 0,
        };
        for mail in mails {
            if after_uid.map(|last| mail.uid <= last).unwrap_or(false) {
                continue;
            }

            let messages = match self.inner.jira.parse(&mail.subject, &mail.html, Some(&allowed)) {
                Some(summaries) => summaries,
                None if cfg.notifications.mail => {
                    vec![new_mail_notification(&mail.from, &mail.subject)]
                }
                None => Vec::new(),
            };

            for text in messages {
                match self
                    .inner
                    .messenger
                    .send_html(user.chat(), &text, opts)
                    .await
                {
                    Ok(_) => report.delivered += 1,
                    Err(e) => tracing::warn!(user_id = user.0, uid = mail.uid, "send failed: {e}"),
                }
            }

            self.inner.store.record_uid(user, mail.uid)?;
        }

        self.inner.store.record_check_time(user, now_local)?;
        Ok(report)
    }
}
