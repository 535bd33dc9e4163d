use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::Result;

pub const NO_SUBJECT: &str = "(no subject)";
pub const UNKNOWN_SENDER: &str = "(unknown)";

/// How the stored secret authenticates against IMAP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Plain `LOGIN` with an app password.
    Password,
    /// `AUTHENTICATE XOAUTH2` with an access token.
    #[default]
    OAuth,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub email: String,
    pub secret: String,
    pub auth: AuthMethod,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("email", &self.email)
            .field("secret", &"<redacted>")
            .field("auth", &self.auth)
            .finish()
    }
}

/// One message pulled from the inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedMail {
    pub uid: u32,
    pub subject: String,
    pub from: String,
    /// First `text/html` part, decoded; empty when the message has none.
    pub html: String,
}

/// Hexagonal port for reading a mailbox.
#[async_trait]
pub trait MailboxPort: Send + Sync {
    /// Check that `email`/`password` can log in to `host`.
    async fn verify_login(&self, host: &str, email: &str, password: &str) -> Result<()>;

    /// Messages received on or after `since` whose UID is greater than
    /// `after_uid`, in ascending UID order. The mailbox is opened read-only.
    async fn fetch_since(
        &self,
        credentials: &Credentials,
        since: NaiveDate,
        after_uid: Option<u32>,
    ) -> Result<Vec<FetchedMail>>;
}

/// IMAP `SEARCH SINCE` date, e.g. `20-Mar-2025`.
pub fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}
