//! IMAP adapter for `MailboxPort`.
//!
//! The `imap` crate is synchronous, so every session runs on the blocking
//! pool. Socket timeouts bound each network call and an outer
//! `tokio::time::timeout` bounds the whole session.

mod message;

use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use jmn_core::{
    config::Config,
    errors::Error,
    mailbox::{imap_date, AuthMethod, Credentials, FetchedMail, MailboxPort},
    Result,
};
use native_tls::{TlsConnector, TlsStream};

pub use message::parse_message;

type Session = imap::Session<TlsStream<TcpStream>>;

const MIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
pub struct ImapSettings {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            port: 993,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ImapMailbox {
    settings: ImapSettings,
}

impl ImapMailbox {
    /// A zero socket timeout is rejected by std, so it is raised to one second.
    pub fn new(mut settings: ImapSettings) -> Self {
        settings.timeout = settings.timeout.max(MIN_TIMEOUT);
        Self { settings }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(ImapSettings {
            port: cfg.imap_port,
            timeout: cfg.imap_timeout,
        })
    }

    /// The socket timeouts apply per call, so a whole session gets a few of them.
    fn session_timeout(&self) -> Duration {
        self.settings.timeout.saturating_mul(4)
    }

    async fn blocking<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.session_timeout(), task).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => Err(Error::Mail(format!("{what} task failed: {e}"))),
            Err(_) => Err(Error::Mail(format!("{what} timed out"))),
        }
    }
}

#[async_trait]
impl MailboxPort for ImapMailbox {
    async fn verify_login(&self, host: &str, email: &str, password: &str) -> Result<()> {
        let settings = self.settings;
        let creds = Credentials {
            host: host.to_string(),
            email: email.to_string(),
            secret: password.to_string(),
            auth: AuthMethod::Password,
        };
        self.blocking("imap login", move || {
            let mut session = open_session(&creds, settings)?;
            let _ = session.logout();
            Ok(())
        })
        .await
    }

    async fn fetch_since(
        &self,
        credentials: &Credentials,
        since: NaiveDate,
        after_uid: Option<u32>,
    ) -> Result<Vec<FetchedMail>> {
        let settings = self.settings;
        let creds = credentials.clone();
        self.blocking("imap fetch", move || {
            let mut session = open_session(&creds, settings)?;
            let res = fetch_inbox(&mut session, since, after_uid);
            let _ = session.logout();
            res
        })
        .await
    }
}

struct XOAuth2<'a> {
    user: &'a str,
    token: &'a str,
}

impl imap::Authenticator for XOAuth2<'_> {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.token)
    }
}

fn mail_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Mail(format!("{context}: {e}"))
}

fn open_session(creds: &Credentials, settings: ImapSettings) -> Result<Session> {
    let addr = (creds.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| mail_err("resolve", e))?
        .next()
        .ok_or_else(|| Error::Mail(format!("no address for {}", creds.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, settings.timeout)
        .map_err(|e| mail_err("connect", e))?;
    tcp.set_read_timeout(Some(settings.timeout))?;
    tcp.set_write_timeout(Some(settings.timeout))?;

    let tls = TlsConnector::new().map_err(|e| mail_err("tls", e))?;
    let stream = tls
        .connect(&creds.host, tcp)
        .map_err(|e| mail_err("tls handshake", e))?;

    let mut client = imap::Client::new(stream);
    client.read_greeting().map_err(|e| mail_err("greeting", e))?;

    let session = match creds.auth {
        AuthMethod::Password => client
            .login(&creds.email, &creds.secret)
            .map_err(|(e, _)| mail_err("login", e))?,
        AuthMethod::OAuth => client
            .authenticate(
                "XOAUTH2",
                &XOAuth2 {
                    user: &creds.email,
                    token: &creds.secret,
                },
            )
            .map_err(|(e, _)| mail_err("xoauth2", e))?,
    };
    Ok(session)
}

fn fetch_inbox(
    session: &mut Session,
    since: NaiveDate,
    after_uid: Option<u32>,
) -> Result<Vec<FetchedMail>> {
    session
        .examine("INBOX")
        .map_err(|e| mail_err("examine", e))?;

    let query = format!("SINCE {}", imap_date(since));
    let mut uids: Vec<u32> = session
        .uid_search(&query)
        .map_err(|e| mail_err("search", e))?
        .into_iter()
        .filter(|uid| after_uid.map(|last| *uid > last).unwrap_or(true))
        .collect();
    uids.sort_unstable();

    Ok(fetch_each(&uids, |uid| {
        let fetches = session
            .uid_fetch(uid.to_string(), "BODY.PEEK[]")
            .map_err(|e| mail_err("fetch", e))?;
        Ok(fetches.iter().find_map(|f| f.body()).map(<[u8]>::to_vec))
    }))
}

/// Fetch and parse each UID in order. A message that cannot be fetched is
/// logged and skipped so the rest of the pass is still delivered.
fn fetch_each(
    uids: &[u32],
    mut fetch_one: impl FnMut(u32) -> Result<Option<Vec<u8>>>,
) -> Vec<FetchedMail> {
    let mut out = Vec::with_capacity(uids.len());
    for &uid in uids {
        match fetch_one(uid) {
            Ok(Some(body)) => out.push(message::parse_message(uid, &body)),
            Ok(None) => tracing::warn!(uid, "message has no body"),
            Err(e) => tracing::warn!(uid, "skipping message: {e}"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_response_format() {
        let auth = XOAuth2 {
            user: "me@yandex.ru",
            token: "tok",
        };
        assert_eq!(
            imap::Authenticator::process(&auth, b""),
            "user=me@yandex.ru\x01auth=Bearer tok\x01\x01"
        );
    }

    #[test]
    fn failed_fetch_skips_only_that_message() {
        let raw = |subject: &str| format!("Subject: {subject}\r\n\r\nbody").into_bytes();
        let mails = fetch_each(&[10, 11, 12, 13], |uid| match uid {
            11 => Err(Error::Mail("fetch: connection reset".into())),
            12 => Ok(None),
            _ => Ok(Some(raw(&format!("mail {uid}")))),
        });
        let got: Vec<(u32, &str)> = mails.iter().map(|m| (m.uid, m.subject.as_str())).collect();
        assert_eq!(got, vec![(10, "mail 10"), (13, "mail 13")]);
    }

    #[test]
    fn timeouts_are_clamped() {
        let zero = ImapMailbox::new(ImapSettings {
            port: 993,
            timeout: Duration::ZERO,
        });
        assert_eq!(zero.settings.timeout, Duration::from_secs(1));
        assert_eq!(zero.session_timeout(), Duration::from_secs(4));

        let huge = ImapMailbox::new(ImapSettings {
            port: 993,
            timeout: Duration::MAX,
        });
        assert_eq!(huge.session_timeout(), Duration::MAX);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_mail_error() {
        let mailbox = ImapMailbox::new(ImapSettings {
            port: 1,
            timeout: Duration::from_secs(2),
        });
        let err = mailbox
            .verify_login("127.0.0.1", "me@yandex.ru", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Mail(_)), "{err}");
    }
}
