use std::sync::Arc;

use teloxide::prelude::*;

use jmn_core::domain::{ChatId, UserId};

use crate::router::AppState;

use super::respond;

pub async fn handle_text(_bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let chat_id = ChatId(msg.chat.id.0);

    let result = state.conversation.on_text(user_id, chat_id, text).await;
    respond(&state, chat_id, result).await;
    Ok(())
}
