use std::sync::Arc;

use teloxide::prelude::*;

use jmn_core::{
    conversation::Reply,
    domain::{ChatId, UserId},
    formatting::escape_html,
};

use crate::router::AppState;

use super::respond;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn unknown_command(cmd: &str) -> Reply {
    Reply::text(format!(
        "Unknown command /{}. Send /start to open the menu.",
        escape_html(cmd)
    ))
}

pub async fn handle_command(_bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let chat_id = ChatId(msg.chat.id.0);
    let (cmd, _args) = parse_command(text);
    tracing::info!(user_id = user_id.0, cmd = %cmd, "command");

    let result = match cmd.as_str() {
        "start" => state.conversation.start(user_id, chat_id).await,
        "connect" => state.conversation.connect(user_id).await,
        _ => Ok(vec![unknown_command(&cmd)]),
    };

    respond(&state, chat_id, result).await;
    Ok(())
}
