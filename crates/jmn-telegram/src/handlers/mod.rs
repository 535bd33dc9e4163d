//! Telegram update handlers.
//!
//! Each handler is a thin adapter: it extracts ids and text from the update,
//! hands them to the core `Conversation` and sends back whatever replies it
//! produced.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use jmn_core::{
    conversation::Reply,
    domain::ChatId,
    messaging::{port::MessagingPort, types::SendOptions},
};

use crate::router::AppState;

mod callback;
mod commands;
mod text;

const INTERNAL_ERROR: &str = "⚠️ Something went wrong. Please try again or send /start.";

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    // Photos, stickers and the like are not part of the menu.
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let _guard = state.chat_locks.lock_chat(msg.chat.id.0).await;
    if text.starts_with('/') {
        return commands::handle_command(bot, msg, state).await;
    }
    text::handle_text(bot, msg, state).await
}

/// Deliver menu replies in order; the first failure stops the rest.
pub(crate) async fn send_replies(state: &AppState, chat_id: ChatId, replies: Vec<Reply>) {
    for reply in replies {
        let res = match reply.keyboard {
            Some(kb) => state.messenger.send_keyboard(chat_id, &reply.html, kb).await,
            None => {
                state
                    .messenger
                    .send_html(chat_id, &reply.html, SendOptions::default())
                    .await
            }
        };
        if let Err(e) = res {
            tracing::warn!(chat_id = chat_id.0, "failed to send reply: {e}");
            return;
        }
    }
}

/// Send replies or, when the conversation failed, a generic error.
pub(crate) async fn respond(
    state: &AppState,
    chat_id: ChatId,
    result: jmn_core::Result<Vec<Reply>>,
) {
    match result {
        Ok(replies) => send_replies(state, chat_id, replies).await,
        Err(e) => {
            tracing::error!(chat_id = chat_id.0, "menu action failed: {e}");
            send_replies(state, chat_id, vec![Reply::text(INTERNAL_ERROR)]).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ChatLocks;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use jmn_core::{
        conversation::Conversation,
        domain::{MessageId, MessageRef},
        errors::Error,
        mailbox::{Credentials, FetchedMail, MailboxPort},
        messaging::types::InlineKeyboard,
        store::UserStore,
    };
    use std::sync::Mutex;

    struct NoMail;

    #[async_trait]
    impl MailboxPort for NoMail {
        async fn verify_login(&self, _: &str, _: &str, _: &str) -> jmn_core::Result<()> {
            Ok(())
        }

        async fn fetch_since(
            &self,
            _: &Credentials,
            _: NaiveDate,
            _: Option<u32>,
        ) -> jmn_core::Result<Vec<FetchedMail>> {
            Ok(Vec::new())
        }
    }

    /// Records sends; fails every send after the first `ok` ones.
    struct Outbox {
        ok: usize,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessagingPort for Outbox {
        async fn send_html(
            &self,
            chat: ChatId,
            html: &str,
            _: SendOptions,
        ) -> jmn_core::Result<MessageRef> {
            let mut sent = self.sent.lock().unwrap();
            if sent.len() >= self.ok {
                return Err(Error::External("telegram error: blocked".into()));
            }
            sent.push(html.to_string());
            Ok(MessageRef {
                chat_id: chat,
                message_id: MessageId(1),
            })
        }

        async fn send_keyboard(
            &self,
            chat: ChatId,
            html: &str,
            _: InlineKeyboard,
        ) -> jmn_core::Result<MessageRef> {
            self.send_html(chat, html, SendOptions::default()).await
        }

        async fn answer_callback_query(&self, _: &str, _: Option<&str>) -> jmn_core::Result<()> {
            Ok(())
        }
    }

    fn state(name: &str, ok: usize) -> (std::path::PathBuf, Arc<Outbox>, AppState) {
        let dir = std::env::temp_dir().join(format!("jmn-handlers-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(UserStore::open(dir.join("users.json"), "imap.yandex.ru").unwrap());
        let outbox = Arc::new(Outbox {
            ok,
            sent: Mutex::new(Vec::new()),
        });
        let state = AppState {
            messenger: outbox.clone(),
            conversation: Arc::new(Conversation::new(store, Arc::new(NoMail), None)),
            chat_locks: Arc::new(ChatLocks::default()),
        };
        (dir, outbox, state)
    }

    #[tokio::test]
    async fn failed_action_sends_generic_error() {
        let (dir, outbox, state) = state("error", usize::MAX);
        respond(&state, ChatId(1), Err(Error::Config("boom".into()))).await;
        assert_eq!(*outbox.sent.lock().unwrap(), vec![INTERNAL_ERROR.to_string()]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn send_failure_stops_remaining_replies() {
        let (dir, outbox, state) = state("partial", 1);
        let replies = vec![Reply::text("one"), Reply::text("two"), Reply::text("three")];
        respond(&state, ChatId(1), Ok(replies)).await;
        assert_eq!(*outbox.sent.lock().unwrap(), vec!["one".to_string()]);

        // The error notice itself failing is only logged.
        respond(&state, ChatId(1), Err(Error::Config("boom".into()))).await;
        assert_eq!(outbox.sent.lock().unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
