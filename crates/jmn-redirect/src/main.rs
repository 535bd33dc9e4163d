use std::sync::Arc;

use jmn_core::{
    config::Config, messaging::port::MessagingPort, oauth::YandexOAuth, store::UserStore,
};
use jmn_redirect::{router, RedirectState};
use jmn_telegram::TelegramMessenger;

#[tokio::main]
async fn main() -> Result<(), jmn_core::Error> {
    jmn_core::logging::init("jmn_redirect")?;

    let cfg = Config::load()?;
    let oauth = Arc::new(YandexOAuth::new(cfg.require_oauth()?.clone()));
    let store = Arc::new(UserStore::open(&cfg.user_config_file, cfg.imap_host.clone())?);

    let notifier = cfg.bot_token.as_deref().map(|token| {
        Arc::new(TelegramMessenger::from_token(token, cfg.telegram_message_limit))
            as Arc<dyn MessagingPort>
    });
    if notifier.is_none() {
        tracing::warn!("BOT_TOKEN is not set, users will not get a Telegram confirmation");
    }

    let app = router(RedirectState {
        store,
        oauth,
        notifier,
    });

    let listener = tokio::net::TcpListener::bind(cfg.redirect_bind).await?;
    tracing::info!(addr = %cfg.redirect_bind, "redirect server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
