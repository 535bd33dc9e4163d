//! Inline-keyboard menu driven per chat.
//!
//! Transitions:
//!
//! | state              | input                         | next               |
//! |--------------------|-------------------------------|--------------------|
//! | any / none         | `/start`                      | MainMenu           |
//! | MainMenu           | `add_email`                   | AddEmail           |
//! | MainMenu           | `settings`                    | SettingsMenu       |
//! | AddEmail           | `help_email`                  | AddEmail           |
//! | AddEmail           | `cancel_add_email`            | MainMenu           |
//! | AddEmail           | "email password" (login ok)   | MainMenu           |
//! | AddEmail           | anything else typed           | AddEmail           |
//! | SettingsMenu       | `mail_menu`                   | MailMenu           |
//! | SettingsMenu       | `jira_menu`                   | JiraMenu           |
//! | SettingsMenu       | `toggle_*_notifications`      | SettingsMenu       |
//! | SettingsMenu       | `back_to_main`                | MainMenu           |
//! | MailMenu           | `delete_email`                | ConfirmDeleteEmail |
//! | MailMenu           | `back_to_settings`            | SettingsMenu       |
//! | ConfirmDeleteEmail | `delete_yes`                  | MainMenu           |
//! | ConfirmDeleteEmail | `delete_no`                   | MailMenu           |
//! | JiraMenu           | `toggle_jira_<event>`         | JiraMenu           |
//! | JiraMenu           | `back_to_settings`            | SettingsMenu       |

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    domain::{ChatId, UserId},
    formatting::{escape_html, on_off},
    jira::JiraEvent,
    mailbox::{AuthMethod, MailboxPort},
    messaging::types::{InlineButton, InlineKeyboard},
    oauth::YandexOAuth,
    store::{NotificationSettings, UserStore},
    Result,
};

const USE_BUTTONS: &str = "Please use the menu buttons.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MenuState {
    MainMenu,
    AddEmail,
    ConfirmDeleteEmail,
    SettingsMenu,
    MailMenu,
    JiraMenu,
}

/// One outgoing message produced by the menu.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub html: String,
    pub keyboard: Option<InlineKeyboard>,
}

impl Reply {
    pub fn text(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            keyboard: None,
        }
    }

    fn with_keyboard(html: impl Into<String>, keyboard: InlineKeyboard) -> Self {
        Self {
            html: html.into(),
            keyboard: Some(keyboard),
        }
    }
}

pub struct Conversation {
    store: Arc<UserStore>,
    mailbox: Arc<dyn MailboxPort>,
    oauth: Option<YandexOAuth>,
    states: Mutex<HashMap<i64, MenuState>>,
}

impl Conversation {
    pub fn new(
        store: Arc<UserStore>,
        mailbox: Arc<dyn MailboxPort>,
        oauth: Option<YandexOAuth>,
    ) -> Self {
        Self {
            store,
            mailbox,
            oauth,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, chat: ChatId) -> Option<MenuState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&chat.0)
            .copied()
    }

    fn set_state(&self, chat: ChatId, state: MenuState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chat.0, state);
    }

    /// `/start`: entry point and fallback from any state.
    pub async fn start(&self, user: UserId, chat: ChatId) -> Result<Vec<Reply>> {
        self.store.ensure_user(user)?;
        self.set_state(chat, MenuState::MainMenu);
        Ok(vec![Reply::with_keyboard(
            "Hi! I forward Jira and mail notifications.\nPick an action below.",
            self.main_keyboard(user)?,
        )])
    }

    /// `/connect`: Yandex authorization link.
    pub async fn connect(&self, user: UserId) -> Result<Vec<Reply>> {
        let Some(oauth) = &self.oauth else {
            return Ok(vec![Reply::text(
                "Yandex sign-in is not configured on this bot. Use /start to add a mailbox with an app password.",
            )]);
        };
        let url = oauth.authorize_url(user)?;
        Ok(vec![Reply::with_keyboard(
            "Open the link to give the bot read access to your Yandex mailbox.",
            InlineKeyboard::one_per_row(vec![InlineButton::url("Connect with Yandex", url)]),
        )])
    }

    pub async fn on_text(&self, user: UserId, chat: ChatId, text: &str) -> Result<Vec<Reply>> {
        match self.state(chat) {
            None => Ok(vec![Reply::text("Send /start to open the menu.")]),
            Some(MenuState::AddEmail) => self.add_email(user, chat, text).await,
            Some(_) => Ok(vec![Reply::text(USE_BUTTONS)]),
        }
    }

    /// Returns no replies for buttons that do not belong to the current state.
    pub async fn on_callback(&self, user: UserId, chat: ChatId, data: &str) -> Result<Vec<Reply>> {
        let Some(state) = self.state(chat) else {
            tracing::debug!(user_id = user.0, data, "callback outside of a conversation");
            return Ok(Vec::new());
        };

        let (replies, next) = match (state, data) {
            (MenuState::MainMenu, "add_email") => (
                vec![Reply::with_keyboard(
                    "Send your address and app password in one message:\n\n\
                     <code>email@example.com password</code>\n\n\
                     Press Help for instructions or Cancel to go back.",
                    add_email_keyboard(),
                )],
                MenuState::AddEmail,
            ),
            (MenuState::MainMenu, "settings") => (
                vec![self.settings_reply(user, "Opening settings...")?],
                MenuState::SettingsMenu,
            ),

            (MenuState::AddEmail, "help_email") => (vec![Reply::text(HELP_EMAIL)], MenuState::AddEmail),
            (MenuState::AddEmail, "cancel_add_email") => (
                vec![Reply::with_keyboard(
                    "Cancelled. Back to the main menu.",
                    self.main_keyboard(user)?,
                )],
                MenuState::MainMenu,
            ),

            (MenuState::SettingsMenu, "mail_menu") => (
                vec![Reply::with_keyboard("Mail settings", self.mail_keyboard(user)?)],
                MenuState::MailMenu,
            ),
            (MenuState::SettingsMenu, "jira_menu") => (
                vec![Reply::with_keyboard(
                    "Jira notification settings",
                    self.jira_keyboard(user)?,
                )],
                MenuState::JiraMenu,
            ),
            (MenuState::SettingsMenu, "toggle_mail_notifications") => {
                let on = self.store.toggle_mail_notifications(user)?;
                (
                    vec![self.settings_reply(user, &format!("Notifications for regular mail: {}", on_off(on)))?],
                    MenuState::SettingsMenu,
                )
            }
            (MenuState::SettingsMenu, "toggle_quiet_notifications") => {
                let on = self.store.toggle_quiet_notifications(user)?;
                (
                    vec![self.settings_reply(
                        user,
                        &format!("Silent delivery outside working hours: {}", on_off(on)),
                    )?],
                    MenuState::SettingsMenu,
                )
            }
            (MenuState::SettingsMenu, "back_to_main") => (
                vec![Reply::with_keyboard("Main menu", self.main_keyboard(user)?)],
                MenuState::MainMenu,
            ),

            (MenuState::MailMenu, "delete_email") => (
                vec![Reply::with_keyboard(
                    "Do you really want to remove the mailbox?",
                    confirm_delete_keyboard(),
                )],
                MenuState::ConfirmDeleteEmail,
            ),
            (MenuState::MailMenu | MenuState::JiraMenu, "back_to_settings") => (
                vec![self.settings_reply(user, "Settings")?],
                MenuState::SettingsMenu,
            ),

            (MenuState::ConfirmDeleteEmail, "delete_yes") => {
                self.store.clear_email_credentials(user)?;
                tracing::info!(user_id = user.0, "mailbox removed");
                (
                    vec![Reply::with_keyboard("Mailbox removed!", self.main_keyboard(user)?)],
                    MenuState::MainMenu,
                )
            }
            (MenuState::ConfirmDeleteEmail, "delete_no") => (
                vec![Reply::with_keyboard("Removal cancelled.", self.mail_keyboard(user)?)],
                MenuState::MailMenu,
            ),

            (MenuState::JiraMenu, data) if data.starts_with("toggle_jira_") => {
                let key = &data["toggle_jira_".len()..];
                let Some(event) = JiraEvent::from_key(key) else {
                    tracing::warn!(user_id = user.0, key, "unknown jira event toggle");
                    return Ok(Vec::new());
                };
                let on = self.store.toggle_jira_notification(user, event)?;
                (
                    vec![Reply::with_keyboard(
                        format!("Toggled '{}' → {}", event.key(), on_off(on)),
                        self.jira_keyboard(user)?,
                    )],
                    MenuState::JiraMenu,
                )
            }

            _ => {
                tracing::debug!(user_id = user.0, ?state, data, "callback ignored in this state");
                return Ok(Vec::new());
            }
        };

        self.set_state(chat, next);
        Ok(replies)
    }

    async fn add_email(&self, user: UserId, chat: ChatId, text: &str) -> Result<Vec<Reply>> {
        let parts: Vec<&str> = text.split_whitespace().collect();
        let [email, password] = parts.as_slice() else {
            return Ok(vec![Reply::text(
                "❌ Wrong format. Try again or press Cancel.",
            )]);
        };

        if let Err(e) = self
            .mailbox
            .verify_login(self.store.default_host(), email, password)
            .await
        {
            tracing::warn!(user_id = user.0, "mailbox login failed: {e}");
            return Ok(vec![Reply::text(format!(
                "❌ Could not log in to the mailbox:\n{}\n\nTry again or press Cancel.",
                escape_html(&e.to_string())
            ))]);
        }

        self.store
            .set_email_credentials(user, email, password, AuthMethod::Password)?;
        tracing::info!(user_id = user.0, "mailbox saved");
        self.set_state(chat, MenuState::MainMenu);
        Ok(vec![Reply::with_keyboard(
            "✅ Mailbox saved! Back to the main menu.",
            self.main_keyboard(user)?,
        )])
    }

    fn main_keyboard(&self, user: UserId) -> Result<InlineKeyboard> {
        let connected = self.store.email_credentials(user)?.is_some();
        let mut buttons = Vec::new();
        if connected {
            buttons.push(InlineButton::callback("Settings", "settings"));
        } else {
            buttons.push(InlineButton::callback("Add email", "add_email"));
            if let Some(oauth) = &self.oauth {
                buttons.push(InlineButton::url(
                    "Connect with Yandex",
                    oauth.authorize_url(user)?,
                ));
            }
        }
        Ok(InlineKeyboard::one_per_row(buttons))
    }

    fn settings_reply(&self, user: UserId, html: &str) -> Result<Reply> {
        let n = self.store.notifications(user)?;
        Ok(Reply::with_keyboard(html, settings_keyboard(&n)))
    }

    fn mail_keyboard(&self, user: UserId) -> Result<InlineKeyboard> {
        let mut buttons = Vec::new();
        if self.store.email_credentials(user)?.is_some() {
            buttons.push(InlineButton::callback("Delete", "delete_email"));
        }
        buttons.push(InlineButton::callback("Back", "back_to_settings"));
        Ok(InlineKeyboard::one_per_row(buttons))
    }

    fn jira_keyboard(&self, user: UserId) -> Result<InlineKeyboard> {
        let jira = self.store.notifications(user)?.jira;
        let mut buttons: Vec<InlineButton> = JiraEvent::MENU_ORDER
            .into_iter()
            .map(|event| {
                InlineButton::callback(
                    format!("{} [{}]", event.key(), on_off(jira.get(event))),
                    format!("toggle_jira_{}", event.key()),
                )
            })
            .collect();
        buttons.push(InlineButton::callback("Back", "back_to_settings"));
        Ok(InlineKeyboard::one_per_row(buttons))
    }
}

const HELP_EMAIL: &str = "1. Open https://mail.yandex.ru/?#setup/client and make sure these are checked:\n\
- From the imap.yandex.ru server via IMAP\n\
- App passwords and OAuth tokens\n\n\
2. Open https://id.yandex.ru/security/app-passwords\n\
and create an app password named 'Notification bot'.";

fn settings_keyboard(n: &NotificationSettings) -> InlineKeyboard {
    InlineKeyboard::one_per_row(vec![
        InlineButton::callback("Mail", "mail_menu"),
        InlineButton::callback("Jira notifications", "jira_menu"),
        InlineButton::callback(
            format!("Email notifications [{}]", on_off(n.mail)),
            "toggle_mail_notifications",
        ),
        InlineButton::callback(
            format!("Quiet hours [{}]", on_off(n.quiet_notifications)),
            "toggle_quiet_notifications",
        ),
        InlineButton::callback("Back", "back_to_main"),
    ])
}

fn add_email_keyboard() -> InlineKeyboard {
    InlineKeyboard::new(vec![vec![
        InlineButton::callback("Help", "help_email"),
        InlineButton::callback("Cancel", "cancel_add_email"),
    ]])
}

fn confirm_delete_keyboard() -> InlineKeyboard {
    InlineKeyboard::new(vec![vec![
        InlineButton::callback("Yes", "delete_yes"),
        InlineButton::callback("No", "delete_no"),
    ]])
}
