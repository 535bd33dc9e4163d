use std::sync::Arc;

use teloxide::prelude::*;

use jmn_core::{
    domain::{ChatId, UserId},
    messaging::port::MessagingPort,
};

use crate::router::AppState;

use super::respond;

pub async fn handle_callback(
    _bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    // Always answer so the client stops the spinner, even for stale buttons.
    if let Err(e) = state.messenger.answer_callback_query(&q.id, None).await {
        tracing::warn!("answer_callback_query failed: {e}");
    }

    let Some(chat_id) = q.message.as_ref().map(|m| ChatId(m.chat.id.0)) else {
        return Ok(());
    };
    let Some(data) = q.data.as_deref().filter(|d| !d.is_empty()) else {
        return Ok(());
    };
    let user_id = UserId(q.from.id.0 as i64);

    let _guard = state.chat_locks.lock_chat(chat_id.0).await;
    tracing::debug!(user_id = user_id.0, data, "callback");
    let result = state.conversation.on_callback(user_id, chat_id, data).await;
    respond(&state, chat_id, result).await;
    Ok(())
}
