use std::sync::Arc;

use tracing::{info, warn};

use courier_infra::QueueConfig;
use courier_infra::jobs::{
    DeliveryError, Dispatcher, DispatcherHandle, DispatcherStats, DispatcherStatsHandle,
    LogNotifier, NotificationQueue, Notifier, NotifierRouter, PromotionSweeper, QueueError,
    WebhookNotifier,
};
use courier_infra::workers::WorkerHandle;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Notifier(#[from] DeliveryError),
}

/// Shared state behind every route.
#[derive(Debug, Clone)]
pub struct AppServices {
    queue: NotificationQueue,
    dispatcher: Option<DispatcherStatsHandle>,
}

impl AppServices {
    pub fn new(queue: NotificationQueue, dispatcher: Option<DispatcherStatsHandle>) -> Self {
        Self { queue, dispatcher }
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    /// `None` when this process runs no dispatcher.
    pub fn dispatcher_stats(&self) -> Option<DispatcherStats> {
        self.dispatcher.as_ref().map(DispatcherStatsHandle::snapshot)
    }
}

/// Sweeper and dispatcher tasks started alongside the HTTP server.
#[derive(Debug)]
pub struct BackgroundWorkers {
    sweeper: WorkerHandle,
    dispatcher: DispatcherHandle,
}

impl BackgroundWorkers {
    pub async fn shutdown(self) {
        self.sweeper.shutdown().await;
        self.dispatcher.shutdown().await;
        info!("background workers stopped");
    }
}

/// Webhook delivery when configured, log delivery otherwise.
pub fn build_notifier(config: &QueueConfig) -> Result<Arc<dyn Notifier>, DeliveryError> {
    let fallback: Arc<dyn Notifier> = match config.webhook_url.as_deref() {
        Some(url) => {
            let webhook = WebhookNotifier::new(url, config.webhook_token.clone())?;
            info!(url = %webhook.url(), "delivering notifications via webhook");
            Arc::new(webhook)
        }
        None => {
            warn!("NOTIFY_WEBHOOK_URL not set; notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    Ok(Arc::new(NotifierRouter::new().route("*", fallback)))
}

/// Connect the queue and start one sweeper and the dispatcher pool.
pub async fn build_services(
    config: &QueueConfig,
) -> Result<(AppServices, BackgroundWorkers), StartupError> {
    let queue = NotificationQueue::connect(config).await?;
    let notifier = build_notifier(config)?;

    let sweeper = PromotionSweeper::new(queue.store(), config.sweeper_config()).spawn();
    let dispatcher = Dispatcher::new(
        queue.store(),
        notifier,
        config.retry.clone(),
        config.dispatcher_config(),
    )
    .spawn(config.workers);

    info!(
        backend = %queue.backend(),
        workers = config.workers,
        max_attempts = config.retry.max_attempts,
        "notification services started"
    );

    let services = AppServices::new(queue, Some(dispatcher.stats_handle()));
    Ok((services, BackgroundWorkers { sweeper, dispatcher }))
}
