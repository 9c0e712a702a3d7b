//! HTTP webhook adapter.

use crate::adapters::{WebhookReceipt, WebhookSender};
use crate::OutboxResult;
use async_trait::async_trait;
use reqwest::{redirect, Client};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Longest response body kept in `last_error`.
const MAX_ERROR_BODY: usize = 512;

/// Posts JSON payloads to webhook targets.
///
/// Redirects are not followed: a redirect could point at an address the URL
/// policy would have rejected.
#[derive(Clone)]
pub struct HttpWebhookSender {
    client: Client,
}

impl HttpWebhookSender {
    pub fn new(user_agent: &str) -> OutboxResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, url: &Url, payload: &serde_json::Value, timeout: Duration) -> WebhookReceipt {
        debug!(url = %url, "Posting webhook");

        let response = match self
            .client
            .post(url.clone())
            .timeout(timeout)
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Webhook request failed");
                return WebhookReceipt::failed(request_error_code(&e), e.to_string());
            }
        };

        let status = response.status();
        if status.is_success() {
            return WebhookReceipt::delivered();
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        WebhookReceipt::failed(format!("http_{}", status.as_u16()), format!("HTTP {}: {}", status, body))
    }
}

fn request_error_code(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect"
    } else {
        "request"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering every connection with `response`.
    async fn serve(response: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        Url::parse(&format!("http://{addr}/hook")).unwrap()
    }

    #[tokio::test]
    async fn test_success_status_is_delivered() {
        let url = serve("HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let sender = HttpWebhookSender::new("courier-test").unwrap();
        let receipt = sender.send(&url, &json!({"a": 1}), Duration::from_secs(5)).await;
        assert_eq!(receipt, WebhookReceipt::delivered());
    }

    #[tokio::test]
    async fn test_error_status_maps_to_code() {
        let url = serve(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy",
        )
        .await;
        let sender = HttpWebhookSender::new("courier-test").unwrap();
        let receipt = sender.send(&url, &json!({}), Duration::from_secs(5)).await;
        assert!(!receipt.ok);
        assert_eq!(receipt.error_code.as_deref(), Some("http_503"));
        assert!(receipt.error.unwrap().ends_with("busy"));
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let url = serve(
            "HTTP/1.1 302 Found\r\nLocation: http://169.254.169.254/\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let sender = HttpWebhookSender::new("courier-test").unwrap();
        let receipt = sender.send(&url, &json!({}), Duration::from_secs(5)).await;
        assert_eq!(receipt.error_code.as_deref(), Some("http_302"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender = HttpWebhookSender::new("courier-test").unwrap();
        let url = Url::parse(&format!("http://{addr}/hook")).unwrap();
        let receipt = sender.send(&url, &json!({}), Duration::from_secs(5)).await;
        assert!(!receipt.ok);
        assert!(receipt.error_code.is_some());
    }
}
