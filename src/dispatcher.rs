//! Shared sink for every push the core emits.
//!
//! Gateway failures stop here: they are logged and counted, and the caller
//! gets a [`DispatchReport`] instead of an error.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::models::DeviceId;
use crate::notification::{Notification, PushMessage};

/// Push transport failure
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Gateway rejected or failed the request
    #[error("push gateway error: {0}")]
    Gateway(String),

    /// Message could not be rendered
    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// External push transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Deliver one notification to a set of devices
    async fn send(&self, device_ids: &[DeviceId], notification: &Notification) -> Result<(), DispatchError>;
}

/// What happened to one dispatch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReport {
    /// Gateway accepted the push for this many devices
    Sent(usize),
    /// No recipients; the gateway was not called
    Skipped,
    /// Gateway or encoding failed; already logged
    Failed,
}

impl DispatchReport {
    /// True when the gateway accepted the push
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }
}

/// Turns (recipients, message) pairs into gateway calls
#[derive(Clone)]
pub struct Dispatcher {
    gateway: Arc<dyn PushGateway>,
}

impl Dispatcher {
    /// Wrap a gateway
    pub fn new(gateway: Arc<dyn PushGateway>) -> Self {
        Self { gateway }
    }

    /// Send `message` to `device_ids`; never fails
    pub async fn send(&self, device_ids: &[DeviceId], message: &PushMessage) -> DispatchReport {
        if device_ids.is_empty() {
            debug!(kind = message.kind(), "no recipients, skipping dispatch");
            return DispatchReport::Skipped;
        }

        let result = match message.render() {
            Ok(notification) => self.gateway.send(device_ids, &notification).await,
            Err(e) => Err(DispatchError::from(e)),
        };

        match result {
            Ok(()) => {
                debug!(kind = message.kind(), recipients = device_ids.len(), "push dispatched");
                metrics::record_dispatch(message.kind(), device_ids.len(), true);
                DispatchReport::Sent(device_ids.len())
            }
            Err(e) => {
                warn!(kind = message.kind(), recipients = device_ids.len(), error = %e, "push dispatch failed");
                metrics::record_dispatch(message.kind(), device_ids.len(), false);
                DispatchReport::Failed
            }
        }
    }
}

/// Gateway that only logs; used by the binary when no transport is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGateway;

#[async_trait]
impl PushGateway for LogGateway {
    async fn send(&self, device_ids: &[DeviceId], notification: &Notification) -> Result<(), DispatchError> {
        info!(
            recipients = device_ids.len(),
            title = %notification.title,
            data = %notification.data,
            "push"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> PushMessage {
        PushMessage::ProgramStarted {
            program_id: 1,
            program_title: "Quiz".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_recipients_skip_gateway() {
        let mut gateway = MockPushGateway::new();
        gateway.expect_send().never();
        let dispatcher = Dispatcher::new(Arc::new(gateway));

        assert_eq!(dispatcher.send(&[], &started()).await, DispatchReport::Skipped);
    }

    #[tokio::test]
    async fn test_gateway_failure_is_swallowed() {
        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send()
            .times(1)
            .returning(|_, _| Err(DispatchError::Gateway("503".to_string())));
        let dispatcher = Dispatcher::new(Arc::new(gateway));

        let report = dispatcher.send(&["dev-1".to_string()], &started()).await;
        assert_eq!(report, DispatchReport::Failed);
        assert!(!report.is_sent());
    }

    #[tokio::test]
    async fn test_gateway_receives_rendered_message() {
        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send()
            .withf(|ids, notification| ids.len() == 2 && notification.data["type"] == "PROGRAM_STARTED")
            .times(1)
            .returning(|_, _| Ok(()));
        let dispatcher = Dispatcher::new(Arc::new(gateway));

        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(dispatcher.send(&ids, &started()).await, DispatchReport::Sent(2));
    }
}
