use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use words_storage::Credentials;

use super::ServiceAdapter;
use crate::error::{DeliveryError, RepostError};

/// Credential key holding the target chat (e.g. `@channel`).
pub const CHANNEL_KEY: &str = "channel_name";

/// Telegram Bot API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// HTTP(S) proxy for all Bot API calls.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            proxy: None,
            api_base: default_api_base(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Formats the repost message: bold title, blank line, link.
pub fn format_message(title: &str, url: &str) -> String {
    format!("*{title}*\n\n{url}")
}

/// Sends reposts through the Telegram Bot API `sendMessage` method.
pub struct TelegramAdapter {
    http_client: Client,
    endpoint: String,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig) -> Result<Self, RepostError> {
        if config.bot_token.trim().is_empty() {
            return Err(RepostError::InvalidConfig(
                "telegram.bot_token must be set".into(),
            ));
        }

        let mut builder = Client::builder().timeout(config.request_timeout());
        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| RepostError::InvalidConfig(format!("telegram.proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http_client = builder
            .build()
            .map_err(|e| RepostError::Http(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
        })
    }
}

#[async_trait]
impl ServiceAdapter for TelegramAdapter {
    async fn send(
        &self,
        credentials: &Credentials,
        title: &str,
        url: &str,
    ) -> Result<(), DeliveryError> {
        let chat_id = credentials.get_str(CHANNEL_KEY).ok_or_else(|| {
            DeliveryError::ServiceNotFound(format!("credentials have no {CHANNEL_KEY}"))
        })?;

        let body = json!({
            "chat_id": chat_id,
            "text": format_message(title, url),
            "parse_mode": "Markdown",
        });

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        // Error pages from proxies are not JSON.
        let response_body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() && !response_body.is_object() {
            tracing::warn!(%status, "Telegram accepted the message without a JSON body");
        }

        classify_response(status, &response_body)
    }
}

fn classify_transport_error(err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() || err.is_connect() {
        DeliveryError::ServiceUnavailable(err.to_string())
    } else {
        DeliveryError::ServiceUnknown(err.to_string())
    }
}

/// A 2xx answer is a delivery unless the body says `"ok": false`.
fn classify_response(status: StatusCode, body: &Value) -> Result<(), DeliveryError> {
    if status.is_success() && body["ok"].as_bool() != Some(false) {
        return Ok(());
    }

    let description = body["description"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());

    Err(match status {
        StatusCode::BAD_REQUEST if is_content_error(&description) => {
            DeliveryError::PayloadRejected(description)
        }
        // Telegram answers "chat not found" and similar target errors with 400.
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            DeliveryError::ServiceNotFound(description)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DeliveryError::ServiceUnauthorized(description)
        }
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::ServiceRateLimited {
            retry_after: body["parameters"]["retry_after"]
                .as_u64()
                .map(Duration::from_secs),
            message: description,
        },
        s if s.is_server_error() => DeliveryError::ServiceUnavailable(description),
        _ => DeliveryError::ServiceUnknown(description),
    })
}

fn is_content_error(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    description.contains("can't parse entities")
        || description.contains("message is too long")
        || description.contains("message text is empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "123:abc";

    fn adapter(server: &MockServer) -> TelegramAdapter {
        let config = TelegramConfig::new(TOKEN)
            .with_api_base(server.uri())
            .with_request_timeout(Duration::from_secs(2));
        TelegramAdapter::new(&config).unwrap()
    }

    fn demo() -> Credentials {
        Credentials::new().with(CHANNEL_KEY, "@demo")
    }

    async fn respond(status: u16, body: Value) -> Result<(), DeliveryError> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/bot{TOKEN}/sendMessage")))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        adapter(&server)
            .send(&demo(), "Hello", "https://words.example/alice/hello")
            .await
    }

    #[test]
    fn test_format_message() {
        assert_eq!(
            format_message("Hello", "https://words.example/alice/hello"),
            "*Hello*\n\nhttps://words.example/alice/hello"
        );
    }

    #[test]
    fn test_requires_token() {
        assert!(TelegramAdapter::new(&TelegramConfig::default()).is_err());
    }

    #[test]
    fn test_accepts_http_proxy() {
        let config = TelegramConfig::new(TOKEN).with_proxy("http://127.0.0.1:3128");
        assert!(TelegramAdapter::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_sends_markdown_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/bot{TOKEN}/sendMessage")))
            .and(body_json(json!({
                "chat_id": "@demo",
                "text": "*Hello*\n\nhttps://words.example/alice/hello",
                "parse_mode": "Markdown",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true, "result": {"message_id": 42}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        adapter(&server)
            .send(&demo(), "Hello", "https://words.example/alice/hello")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_success_without_json_body_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/bot{TOKEN}/sendMessage")))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        adapter(&server)
            .send(&demo(), "Hello", "https://words.example/alice/hello")
            .await
            .unwrap();
    }

    #[test]
    fn test_success_with_ok_false_is_not_delivered() {
        let err = classify_response(
            StatusCode::OK,
            &json!({"ok": false, "description": "odd"}),
        )
        .unwrap_err();
        assert!(matches!(err, DeliveryError::ServiceUnknown(_)));
    }

    #[tokio::test]
    async fn test_chat_not_found_is_permanent() {
        let err = respond(
            400,
            json!({"ok": false, "error_code": 400, "description": "Bad Request: chat not found"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DeliveryError::ServiceNotFound(_)));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_kicked_bot_is_unauthorized() {
        let err = respond(
            403,
            json!({"ok": false, "error_code": 403, "description": "Forbidden: bot was kicked from the channel chat"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DeliveryError::ServiceUnauthorized(_)));
    }

    #[tokio::test]
    async fn test_markdown_error_is_payload_rejected() {
        let err = respond(
            400,
            json!({"ok": false, "error_code": 400, "description": "Bad Request: can't parse entities: Can't find end of the entity"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DeliveryError::PayloadRejected(_)));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let err = respond(
            429,
            json!({"ok": false, "error_code": 429, "description": "Too Many Requests: retry after 17", "parameters": {"retry_after": 17}}),
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(17)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let err = respond(502, json!({"ok": false, "description": "Bad Gateway"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let config = TelegramConfig::new(TOKEN)
            .with_api_base(server.uri())
            .with_request_timeout(Duration::from_secs(1));
        let err = TelegramAdapter::new(&config)
            .unwrap()
            .send(&demo(), "Hello", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_channel_is_not_found() {
        let server = MockServer::start().await;
        let err = adapter(&server)
            .send(&Credentials::new(), "Hello", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::ServiceNotFound(_)));
    }
}
