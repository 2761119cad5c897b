//! Delivery side of the queue: the `Notifier` trait and its implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::types::{JobType, Payload};

/// Why a delivery attempt failed. Every variant counts as one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("provider rejected delivery ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("notifier misconfigured: {0}")]
    Misconfigured(String),

    #[error("no notifier registered for job type: {0}")]
    NoRoute(String),

    #[error("delivery timed out after {0} ms")]
    TimedOut(u64),

    #[error("notifier panicked: {0}")]
    Panicked(String),
}

/// Sends one notification.
///
/// Implementations must be safe to call concurrently; the dispatcher invokes
/// `send` from several workers at once.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, job_type: &JobType, payload: &Payload) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    async fn send(&self, job_type: &JobType, payload: &Payload) -> Result<(), DeliveryError> {
        (**self).send(job_type, payload).await
    }
}

/// Routes a job to a notifier by its type tag.
///
/// Lookup order: exact tag, then `"prefix.*"` patterns, then `"*"`.
#[derive(Default, Clone)]
pub struct NotifierRouter {
    routes: HashMap<String, Arc<dyn Notifier>>,
}

impl NotifierRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notifier for a tag or pattern. Re-registering replaces.
    pub fn route(mut self, pattern: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        self.routes.insert(pattern.into(), notifier);
        self
    }

    pub fn resolve(&self, job_type: &JobType) -> Option<&Arc<dyn Notifier>> {
        let tag = job_type.as_str();
        if let Some(n) = self.routes.get(tag) {
            return Some(n);
        }

        // e.g. "payment.*" matches "payment.refunded"
        let mut best: Option<(&str, &Arc<dyn Notifier>)> = None;
        for (pattern, notifier) in &self.routes {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                let matches = tag
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
                if matches && best.is_none_or(|(p, _)| prefix.len() > p.len()) {
                    best = Some((prefix, notifier));
                }
            }
        }
        if let Some((_, n)) = best {
            return Some(n);
        }

        self.routes.get("*")
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for NotifierRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.routes.keys().collect();
        patterns.sort();
        f.debug_struct("NotifierRouter")
            .field("patterns", &patterns)
            .finish()
    }
}

#[async_trait]
impl Notifier for NotifierRouter {
    async fn send(&self, job_type: &JobType, payload: &Payload) -> Result<(), DeliveryError> {
        let notifier = self
            .resolve(job_type)
            .ok_or_else(|| DeliveryError::NoRoute(job_type.to_string()))?;
        notifier.send(job_type, payload).await
    }
}

/// Logs the notification instead of sending it. Used when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, job_type: &JobType, payload: &Payload) -> Result<(), DeliveryError> {
        info!(
            job_type = %job_type,
            payload = %serde_json::Value::Object(payload.clone()),
            "notification delivered to log"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    #[serde(rename = "type")]
    job_type: &'a JobType,
    payload: &'a Payload,
}

/// POSTs `{type, payload}` as JSON to an HTTP endpoint; any non-2xx is a failure.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: reqwest::Url,
    bearer_token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: &str, bearer_token: Option<String>) -> Result<Self, DeliveryError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| DeliveryError::Misconfigured(format!("webhook url {url:?}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url,
            bearer_token,
        })
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, job_type: &JobType, payload: &Payload) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .json(&WebhookBody { job_type, payload });
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(job_type = %job_type, status = status.as_u16(), "webhook accepted notification");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::post};

    use super::*;

    struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Notifier for Tagged {
        async fn send(&self, _: &JobType, _: &Payload) -> Result<(), DeliveryError> {
            self.1.lock().unwrap().push(self.0);
            Ok(())
        }
    }

    fn tagged(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Notifier> {
        Arc::new(Tagged(name, log.clone()))
    }

    fn job_type(tag: &str) -> JobType {
        JobType::new(tag).unwrap()
    }

    #[tokio::test]
    async fn router_prefers_exact_then_longest_category_then_wildcard() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = NotifierRouter::new()
            .route("payment_failed", tagged("exact", &log))
            .route("sms.*", tagged("sms", &log))
            .route("sms.otp.*", tagged("otp", &log))
            .route("*", tagged("fallback", &log));

        for tag in ["payment_failed", "sms.reminder", "sms.otp.login", "smsx", "other"] {
            router.send(&job_type(tag), &Payload::new()).await.unwrap();
        }

        assert_eq!(
            *log.lock().unwrap(),
            vec!["exact", "sms", "otp", "fallback", "fallback"]
        );
    }

    #[tokio::test]
    async fn router_without_match_is_a_delivery_failure() {
        let router = NotifierRouter::new();
        let err = router
            .send(&JobType::booking_confirmation(), &Payload::new())
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::NoRoute("booking_confirmation".into()));
    }

    #[test]
    fn webhook_rejects_bad_url() {
        assert!(matches!(
            WebhookNotifier::new("not a url", None),
            Err(DeliveryError::Misconfigured(_))
        ));
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn webhook_posts_type_and_payload_with_bearer_token() {
        let seen: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>> = Arc::default();
        let sink = seen.clone();
        let app = Router::new().route(
            "/hook",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    sink.lock().unwrap().push((auth, body));
                    StatusCode::NO_CONTENT
                }
            }),
        );
        let base = serve(app).await;

        let notifier =
            WebhookNotifier::new(&format!("{base}/hook"), Some("s3cret".into())).unwrap();
        let mut payload = Payload::new();
        payload.insert("email".into(), serde_json::json!("guest@example.com"));
        notifier
            .send(&JobType::payment_confirmation(), &payload)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some("Bearer s3cret"));
        assert_eq!(
            seen[0].1,
            serde_json::json!({
                "type": "payment_confirmation",
                "payload": {"email": "guest@example.com"}
            })
        );
    }

    #[tokio::test]
    async fn webhook_non_success_status_is_rejected() {
        let app = Router::new().route(
            "/hook",
            post(|| async { (StatusCode::BAD_GATEWAY, "provider down") }),
        );
        let base = serve(app).await;

        let notifier = WebhookNotifier::new(&format!("{base}/hook"), None).unwrap();
        let err = notifier
            .send(&JobType::booking_confirmation(), &Payload::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DeliveryError::Rejected {
                status: 502,
                body: "provider down".into()
            }
        );
    }

    #[tokio::test]
    async fn webhook_unreachable_is_transport_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/hook", None).unwrap();
        let err = notifier
            .send(&JobType::booking_confirmation(), &Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }
}
