//! Yandex OAuth client: authorization link, code exchange and email lookup.

use std::time::Duration;

use reqwest::Url;
use serde_json::Value;

use crate::{config::OAuthConfig, domain::UserId, errors::Error, Result};

const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
const INFO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Yandex account id, used when the email cannot be looked up.
    pub uid: Option<String>,
}

impl TokenGrant {
    pub fn fallback_email(&self) -> String {
        format!("{}@yandex.ru", self.uid.as_deref().unwrap_or("unknown"))
    }
}

#[derive(Clone)]
pub struct YandexOAuth {
    cfg: OAuthConfig,
    http: reqwest::Client,
}

impl YandexOAuth {
    pub fn new(cfg: OAuthConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
        }
    }

    /// Link the user opens to grant mail access. `state` carries the Telegram user id.
    pub fn authorize_url(&self, user: UserId) -> Result<String> {
        let base = format!("{}/authorize", self.cfg.oauth_base_url);
        let state = user.to_string();
        let url = Url::parse_with_params(
            &base,
            &[
                ("response_type", "code"),
                ("client_id", self.cfg.client_id.as_str()),
                ("redirect_uri", self.cfg.redirect_uri.as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid oauth url {base:?}: {e}")))?;
        Ok(url.to_string())
    }

    /// Exchange an authorization code for an access token.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        let resp = self
            .http
            .post(format!("{}/token", self.cfg.oauth_base_url))
            .timeout(TOKEN_TIMEOUT)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::OAuth(body));
        }

        let v: Value = serde_json::from_str(&body)?;
        let access_token = v
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::OAuth("token response has no access_token".to_string()))?
            .to_string();
        let uid = match v.get("uid") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(TokenGrant { access_token, uid })
    }

    /// `default_email` of the account, if the info endpoint returns one.
    pub async fn fetch_email(&self, access_token: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .get(&self.cfg.info_url)
            .timeout(INFO_TIMEOUT)
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let v: Value = resp.json().await?;
        Ok(v.get("default_email")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    /// Email for a fresh grant, falling back to `<uid>@yandex.ru`.
    pub async fn resolve_email(&self, grant: &TokenGrant) -> String {
        match self.fetch_email(&grant.access_token).await {
            Ok(Some(email)) => email,
            Ok(None) => grant.fallback_email(),
            Err(e) => {
                tracing::warn!("email lookup failed, using fallback: {e}");
                grant.fallback_email()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> YandexOAuth {
        YandexOAuth::new(OAuthConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://bot.example/callback".into(),
            oauth_base_url: server.base_url(),
            info_url: server.url("/info?format=json"),
        })
    }

    #[test]
    fn authorize_url_carries_state_and_redirect() {
        let oauth = YandexOAuth::new(OAuthConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://bot.example/callback".into(),
            oauth_base_url: "https://oauth.yandex.ru".into(),
            info_url: "https://login.yandex.ru/info?format=json".into(),
        });
        let url = oauth.authorize_url(UserId(555)).unwrap();
        assert!(url.starts_with("https://oauth.yandex.ru/authorize?response_type=code"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("state=555"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fbot.example%2Fcallback"));
    }

    #[tokio::test]
    async fn exchange_code_posts_form_and_reads_token() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=authorization_code")
                    .body_contains("code=abc")
                    .body_contains("client_secret=secret");
                then.status(200)
                    .json_body(serde_json::json!({"access_token": "tok", "uid": 12345}));
            })
            .await;

        let grant = client(&server).exchange_code("abc").await.unwrap();
        token.assert_async().await;
        assert_eq!(grant.access_token, "tok");
        assert_eq!(grant.uid.as_deref(), Some("12345"));
        assert_eq!(grant.fallback_email(), "12345@yandex.ru");
    }

    #[tokio::test]
    async fn exchange_failure_carries_provider_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(400).body(r#"{"error":"invalid_grant"}"#);
            })
            .await;

        let err = client(&server).exchange_code("bad").await.unwrap_err();
        match err {
            Error::OAuth(body) => assert!(body.contains("invalid_grant")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn resolve_email_uses_info_endpoint_then_falls_back() {
        let server = MockServer::start_async().await;
        let mut info = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/info")
                    .header("Authorization", "OAuth tok");
                then.status(200)
                    .json_body(serde_json::json!({"default_email": "me@yandex.ru"}));
            })
            .await;

        let oauth = client(&server);
        let grant = TokenGrant {
            access_token: "tok".into(),
            uid: Some("9".into()),
        };
        assert_eq!(oauth.resolve_email(&grant).await, "me@yandex.ru");

        info.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/info");
                then.status(401);
            })
            .await;
        assert_eq!(oauth.resolve_email(&grant).await, "9@yandex.ru");
    }
}
