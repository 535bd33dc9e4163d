use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use jmn_core::messaging::throttled::{ThrottleConfig, ThrottledMessenger};
use jmn_core::{
    config::Config,
    conversation::Conversation,
    jira::JiraParser,
    mailbox::MailboxPort,
    messaging::port::MessagingPort,
    oauth::YandexOAuth,
    poller::{MailPoller, PollerSettings},
    store::UserStore,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub messenger: Arc<dyn MessagingPort>,
    pub conversation: Arc<Conversation>,
    pub chat_locks: Arc<ChatLocks>,
}

/// Serializes handling per chat so a slow login check cannot interleave
/// with the next button press.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Run the bot: long polling for updates plus the mail poller, until Ctrl-C.
pub async fn run_polling(
    cfg: Arc<Config>,
    store: Arc<UserStore>,
    mailbox: Arc<dyn MailboxPort>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.require_bot_token()?);

    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "bot started"),
        Err(e) => tracing::warn!("get_me failed: {e}"),
    }
    tracing::info!(
        users = store.users()?.len(),
        check_interval_secs = cfg.check_interval.as_secs(),
        oauth = cfg.oauth.is_some(),
        "configuration loaded"
    );

    // A poll pass can burst several notifications into one chat; the
    // throttling decorator spaces them out, RetryAfter is still retried below it.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(
        bot.clone(),
        cfg.telegram_message_limit,
    ));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let oauth = cfg.oauth.clone().map(YandexOAuth::new);
    let conversation = Arc::new(Conversation::new(store.clone(), mailbox.clone(), oauth));

    let poller = MailPoller::new(
        PollerSettings::from(cfg.as_ref()),
        JiraParser::new(&cfg.jira_host)?,
        store.clone(),
        mailbox,
        messenger.clone(),
    );
    let cancel = CancellationToken::new();
    let poller_task = poller.start(cancel.clone());

    let state = Arc::new(AppState {
        messenger,
        conversation,
        chat_locks: Arc::new(ChatLocks::default()),
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build();

    tokio::select! {
        _ = dispatcher.dispatch() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("failed to listen for ctrl-c: {e}");
            }
            tracing::info!("shutdown requested");
        }
    }

    cancel.cancel();
    if let Err(e) = poller_task.await {
        tracing::error!("mail poller task failed: {e}");
    }
    Ok(())
}
