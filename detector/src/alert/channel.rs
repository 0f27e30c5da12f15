use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use snowtify_common::config::{NotifyConfig, WebhookConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::window::NotificationEvent;

/// An external alert channel.
pub trait Notifier: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Deliver one alert. A single attempt; retrying is the dispatcher's job.
    fn send<'a>(&'a self, event: &'a NotificationEvent) -> BoxFuture<'a, Result<(), NotifyError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to build HTTP client for {channel}: {source}")]
    Client {
        channel: String,
        source: reqwest::Error,
    },
    #[error("request to {channel} failed: {source}")]
    Request {
        channel: String,
        source: reqwest::Error,
    },
    #[error("{channel} answered with HTTP {status}")]
    Status { channel: String, status: u16 },
    #[error("{channel} still failing after {attempts} attempts")]
    DeliveryFailed { channel: String, attempts: u32 },
    #[error("delivery to {channel} cancelled after {attempts} attempts")]
    Cancelled { channel: String, attempts: u32 },
}

/// Posts the configured form fields, plus the alert's tick and timestamp.
pub struct WebhookNotifier {
    name: String,
    url: String,
    form: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|source| NotifyError::Client {
                channel: config.name.clone(),
                source,
            })?;
        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            form: config.form.clone(),
            client,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, event: &'a NotificationEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        async move {
            let mut form = self.form.clone();
            form.insert("tick".into(), event.tick.to_string());
            form.insert("fired_at_ms".into(), event.fired_at_ms.to_string());

            let response = self
                .client
                .post(&self.url)
                .form(&form)
                .send()
                .await
                .map_err(|source| NotifyError::Request {
                    channel: self.name.clone(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(NotifyError::Status {
                    channel: self.name.clone(),
                    status: status.as_u16(),
                });
            }
            debug!(channel = self.name, %status, "webhook accepted alert");
            Ok(())
        }
        .boxed()
    }
}

/// Reports alerts through the log only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn send<'a>(&'a self, event: &'a NotificationEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        info!(tick = event.tick, fired_at_ms = event.fired_at_ms, "SNOW ALERT");
        futures_util::future::ready(Ok(())).boxed()
    }
}

/// Instantiate every channel named in the config.
pub fn build_channels(config: &NotifyConfig) -> Result<Vec<Arc<dyn Notifier>>, NotifyError> {
    let mut channels: Vec<Arc<dyn Notifier>> = Vec::new();
    if config.log {
        channels.push(Arc::new(LogNotifier));
    }
    for webhook in &config.webhooks {
        channels.push(Arc::new(WebhookNotifier::new(webhook)?));
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one HTTP request, answer with `status`, return the raw request.
    async fn one_shot_server(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/alert", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let reply = format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    fn webhook(url: &str) -> WebhookConfig {
        WebhookConfig {
            name: "test-hook".into(),
            url: url.into(),
            form: BTreeMap::from([("username".to_string(), "bill".to_string())]),
            timeout_secs: 5,
        }
    }

    const EVENT: NotificationEvent = NotificationEvent {
        tick: 30,
        fired_at_ms: 1708300000000,
    };

    #[tokio::test]
    async fn webhook_posts_form() {
        let (url, server) = one_shot_server(200).await;
        let notifier = WebhookNotifier::new(&webhook(&url)).unwrap();
        notifier.send(&EVENT).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /alert"));
        assert!(request.contains("username=bill"));
        assert!(request.contains("tick=30"));
        assert!(request.contains("fired_at_ms=1708300000000"));
    }

    #[tokio::test]
    async fn webhook_error_status_fails() {
        let (url, server) = one_shot_server(503).await;
        let notifier = WebhookNotifier::new(&webhook(&url)).unwrap();
        let err = notifier.send(&EVENT).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status { status: 503, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn webhook_unreachable_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/alert", listener.local_addr().unwrap());
        drop(listener);
        let notifier = WebhookNotifier::new(&webhook(&url)).unwrap();
        let err = notifier.send(&EVENT).await.unwrap_err();
        assert!(matches!(err, NotifyError::Request { .. }));
    }

    #[test]
    fn builds_configured_channels() {
        let config = NotifyConfig {
            max_attempts: 3,
            retry_backoff_ms: 10,
            log: true,
            webhooks: vec![webhook("http://localhost:1/alert")],
        };
        let channels = build_channels(&config).unwrap();
        let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["log", "test-hook"]);
    }
}
