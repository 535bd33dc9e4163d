use std::sync::Arc;

use jmn_core::{config::Config, mailbox::MailboxPort, store::UserStore};
use jmn_imap::ImapMailbox;

#[tokio::main]
async fn main() -> Result<(), jmn_core::Error> {
    jmn_core::logging::init("jmn")?;

    let cfg = Arc::new(Config::load()?);
    cfg.require_bot_token()?;

    let store = Arc::new(UserStore::open(&cfg.user_config_file, cfg.imap_host.clone())?);
    let mailbox: Arc<dyn MailboxPort> = Arc::new(ImapMailbox::from_config(&cfg));

    tracing::info!(
        store = %store.path().display(),
        jira_host = %cfg.jira_host,
        "starting telegram bot"
    );

    jmn_telegram::router::run_polling(cfg, store, mailbox)
        .await
        .map_err(|e| jmn_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
