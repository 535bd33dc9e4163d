//! Telegram adapter (teloxide).
//!
//! This crate implements the `jmn-core` MessagingPort over Telegram Bot API
//! and routes updates into the menu conversation.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use jmn_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    formatting::truncate_html,
    messaging::{
        port::MessagingPort,
        types::{ButtonAction, InlineKeyboard, SendOptions},
    },
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
    max_message_len: usize,
}

impl TelegramMessenger {
    pub fn new(bot: Bot, max_message_len: usize) -> Self {
        Self {
            bot,
            max_message_len,
        }
    }

    /// Send-only messenger for processes that do not poll for updates.
    pub fn from_token(token: &str, max_message_len: usize) -> Self {
        Self::new(Bot::new(token), max_message_len)
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    fn fit(&self, html: &str) -> String {
        truncate_html(html, self.max_message_len)
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

/// Convert a core keyboard into Telegram markup.
pub fn to_markup(keyboard: &InlineKeyboard) -> Result<InlineKeyboardMarkup> {
    let mut rows = Vec::with_capacity(keyboard.rows.len());
    for row in &keyboard.rows {
        let mut buttons = Vec::with_capacity(row.len());
        for b in row {
            let button = match &b.action {
                ButtonAction::Callback(data) => {
                    InlineKeyboardButton::callback(b.label.clone(), data.clone())
                }
                ButtonAction::Url(raw) => {
                    let url = reqwest::Url::parse(raw)
                        .map_err(|e| Error::External(format!("invalid button url {raw:?}: {e}")))?;
                    InlineKeyboardButton::url(b.label.clone(), url)
                }
            };
            buttons.push(button);
        }
        rows.push(buttons);
    }
    Ok(InlineKeyboardMarkup::new(rows))
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str, opts: SendOptions) -> Result<MessageRef> {
        let text = self.fit(html);
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), text.clone())
                    .parse_mode(ParseMode::Html)
                    .disable_notification(opts.silent)
                    .disable_web_page_preview(opts.disable_preview)
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let markup = to_markup(&keyboard)?;
        let text = self.fit(html);

        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), text.clone())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true)
                    .reply_markup(markup.clone())
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string());
            }
            req
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jmn_core::messaging::types::InlineButton;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn keyboard_rows_and_button_kinds_are_preserved() {
        let kb = InlineKeyboard::new(vec![
            vec![
                InlineButton::callback("Yes", "delete_yes"),
                InlineButton::callback("No", "delete_no"),
            ],
            vec![InlineButton::url(
                "Connect with Yandex",
                "https://oauth.yandex.ru/authorize?state=1",
            )],
        ]);
        let markup = to_markup(&kb).unwrap();
        assert_eq!(markup.inline_keyboard.len(), 2);
        assert_eq!(markup.inline_keyboard[0].len(), 2);
        assert!(matches!(
            &markup.inline_keyboard[0][1].kind,
            InlineKeyboardButtonKind::CallbackData(d) if d == "delete_no"
        ));
        match &markup.inline_keyboard[1][0].kind {
            InlineKeyboardButtonKind::Url(u) => assert_eq!(u.host_str(), Some("oauth.yandex.ru")),
            other => panic!("unexpected button kind: {other:?}"),
        }
    }

    #[test]
    fn invalid_url_button_is_rejected() {
        let kb = InlineKeyboard::one_per_row(vec![InlineButton::url("x", "not a url")]);
        assert!(to_markup(&kb).is_err());
    }
}
