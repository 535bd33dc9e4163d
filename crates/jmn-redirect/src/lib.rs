//! OAuth redirect server.
//!
//! Yandex sends the browser back to `/callback` with an authorization code and
//! the Telegram user id in `state`. The code is exchanged for a token, the
//! mailbox is stored in the shared user store and the user is told about it.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use jmn_core::{
    domain::UserId,
    errors::Error,
    formatting::escape_html,
    mailbox::AuthMethod,
    messaging::{port::MessagingPort, types::SendOptions},
    oauth::YandexOAuth,
    store::UserStore,
};

#[derive(Clone)]
pub struct RedirectState {
    pub store: Arc<UserStore>,
    pub oauth: Arc<YandexOAuth>,
    /// Present when a bot token is configured.
    pub notifier: Option<Arc<dyn MessagingPort>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

pub fn router(state: RedirectState) -> Router {
    Router::new()
        .route("/callback", get(oauth_callback))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

type Page = (StatusCode, Html<String>);

fn error_page(status: StatusCode, message: &str, detail: Option<&str>) -> Page {
    let inner = match detail {
        Some(d) => format!(
            "<h1>❌ Error</h1><p>{}:<br><span class='accent'>{}</span></p>",
            escape_html(message),
            escape_html(d)
        ),
        None => format!("<h1>❌ Error</h1><p>{}</p>", escape_html(message)),
    };
    (status, Html(render_page(&inner, false)))
}

async fn oauth_callback(
    State(state): State<RedirectState>,
    Query(params): Query<CallbackParams>,
) -> Page {
    let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        return error_page(
            StatusCode::BAD_REQUEST,
            "No authorization code received",
            None,
        );
    };

    let grant = match state.oauth.exchange_code(code).await {
        Ok(g) => g,
        Err(e) => {
            tracing::warn!("token exchange failed: {e}");
            let detail = match e {
                Error::OAuth(body) => body,
                other => other.to_string(),
            };
            return error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not obtain a token",
                Some(&detail),
            );
        }
    };

    let email = state.oauth.resolve_email(&grant).await;

    let user = match params.state.as_deref().map(str::trim).unwrap_or("").parse::<i64>() {
        Ok(id) => UserId(id),
        Err(e) => {
            tracing::warn!(state = ?params.state, "callback with invalid state");
            return error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not save the token",
                Some(&format!("invalid state: {e}")),
            );
        }
    };

    let default_host = state.store.default_host().to_string();
    let saved = state.store.update(user, |cfg| {
        cfg.email.value = Some(email.clone());
        cfg.email.password = Some(grant.access_token.clone());
        cfg.email.host = default_host;
        cfg.email.auth = AuthMethod::OAuth;
    });
    if let Err(e) = saved {
        tracing::error!(user_id = user.0, "failed to store oauth token: {e}");
        return error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Could not save the token",
            Some(&e.to_string()),
        );
    }
    tracing::info!(user_id = user.0, email = %email, "mailbox connected via oauth");

    if let Some(notifier) = &state.notifier {
        let text = format!(
            "✅ Mailbox <b>{}</b> connected!\n\nSend /start to open the settings.",
            escape_html(&email)
        );
        let opts = SendOptions {
            silent: false,
            disable_preview: true,
        };
        if let Err(e) = notifier.send_html(user.chat(), &text, opts).await {
            tracing::warn!(user_id = user.0, "telegram confirmation failed: {e}");
        }
    }

    let inner = format!(
        "<h1>✅ Mailbox <span class='accent'>{}</span> connected</h1>\
         <p>This window will close automatically.</p>",
        escape_html(&email)
    );
    (StatusCode::OK, Html(render_page(&inner, true)))
}

/// Shared page template; `auto_close` closes the window after 3 seconds.
pub fn render_page(inner_html: &str, auto_close: bool) -> String {
    let script = if auto_close {
        "<script>setTimeout(() => window.close(), 3000);</script>"
    } else {
        ""
    };
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Yandex authorization</title>
    <style>
        :root {{
            --bg: #f5f7fa;
            --card-bg: #ffffff;
            --accent: #1a73e8;
            --text: #2b2f33;
        }}
        * {{ box-sizing: border-box; }}
        body {{
            margin: 0;
            height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            background: var(--bg);
        }}
        .card {{
            max-width: 420px;
            padding: 2.5rem 3rem;
            background: var(--card-bg);
            border-radius: 1rem;
            box-shadow: 0 10px 30px rgba(0, 0, 0, .08);
            text-align: center;
        }}
        h1 {{ margin: 0 0 .5rem; font-size: 1.6rem; color: var(--text); }}
        p {{ margin: .25rem 0 0; font-size: 1rem; color: #575c60; }}
        .accent {{ color: var(--accent); font-weight: 600; word-break: break-all; }}
    </style>
    {script}
</head>
<body>
    <div class="card">
        {inner_html}
    </div>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use httpmock::prelude::*;
    use jmn_core::{
        config::OAuthConfig,
        domain::{ChatId, MessageId, MessageRef},
        messaging::types::InlineKeyboard,
    };
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl MessagingPort for Outbox {
        async fn send_html(
            &self,
            chat: ChatId,
            html: &str,
            _: SendOptions,
        ) -> jmn_core::Result<MessageRef> {
            self.sent.lock().unwrap().push((chat.0, html.to_string()));
            Ok(MessageRef {
                chat_id: chat,
                message_id: MessageId(1),
            })
        }

        async fn send_keyboard(
            &self,
            chat: ChatId,
            html: &str,
            _: InlineKeyboard,
        ) -> jmn_core::Result<MessageRef> {
            self.send_html(chat, html, SendOptions::default()).await
        }

        async fn answer_callback_query(&self, _: &str, _: Option<&str>) -> jmn_core::Result<()> {
            Ok(())
        }
    }

    struct Env {
        dir: std::path::PathBuf,
        store: Arc<UserStore>,
        outbox: Arc<Outbox>,
        app: Router,
    }

    impl Drop for Env {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn env(name: &str, server: &MockServer) -> Env {
        let dir = std::env::temp_dir().join(format!("jmn-redirect-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(UserStore::open(dir.join("users.json"), "imap.yandex.ru").unwrap());
        let outbox = Arc::new(Outbox::default());
        let oauth = Arc::new(YandexOAuth::new(OAuthConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "http://localhost:8000/callback".into(),
            oauth_base_url: server.base_url(),
            info_url: server.url("/info?format=json"),
        }));
        let app = router(RedirectState {
            store: store.clone(),
            oauth,
            notifier: Some(outbox.clone() as Arc<dyn MessagingPort>),
        });
        Env {
            dir,
            store,
            outbox,
            app,
        }
    }

    async fn get_page(app: &Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let server = MockServer::start_async().await;
        let e = env("health", &server);
        let (status, body) = get_page(&e.app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn missing_code_is_bad_request() {
        let server = MockServer::start_async().await;
        let e = env("no-code", &server);
        let (status, body) = get_page(&e.app, "/callback?state=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("No authorization code received"));
        assert!(!body.contains("window.close"));
    }

    #[tokio::test]
    async fn successful_callback_stores_mailbox_and_notifies() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token").body_contains("code=abc");
                then.status(200)
                    .json_body(serde_json::json!({"access_token": "tok", "uid": "77"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/info");
                then.status(200)
                    .json_body(serde_json::json!({"default_email": "me@yandex.ru"}));
            })
            .await;
        let e = env("ok", &server);

        let (status, body) = get_page(&e.app, "/callback?code=abc&state=42").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("me@yandex.ru"));
        assert!(body.contains("setTimeout(() => window.close(), 3000)"));

        let creds = e.store.email_credentials(UserId(42)).unwrap().unwrap();
        assert_eq!(creds.email, "me@yandex.ru");
        assert_eq!(creds.secret, "tok");
        assert_eq!(creds.auth, AuthMethod::OAuth);

        let sent = e.outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);
        assert!(sent[0].1.contains("<b>me@yandex.ru</b>"));
        assert!(!sent[0].1.contains("notifications"));
    }

    #[tokio::test]
    async fn token_failure_shows_escaped_provider_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(400).body("<bad code>");
            })
            .await;
        let e = env("token-fail", &server);

        let (status, body) = get_page(&e.app, "/callback?code=zzz&state=42").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("&lt;bad code&gt;"));
        assert!(e.store.get(UserId(42)).unwrap().is_none());
        assert!(e.outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_numeric_state_is_rejected_after_exchange() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body(serde_json::json!({"access_token": "tok"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/info");
                then.status(500);
            })
            .await;
        let e = env("bad-state", &server);

        let (status, body) = get_page(&e.app, "/callback?code=abc&state=alice").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("invalid state"));
        assert!(e.store.users().unwrap().is_empty());
    }
}
