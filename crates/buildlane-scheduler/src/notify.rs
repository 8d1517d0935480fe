//! Agent event outbox and notifier task.
//!
//! Scheduling code publishes [`AgentEvent`]s into an unbounded channel and
//! moves on; a separate task drains it into an [`AgentNotifier`]. A slow or
//! failing notifier therefore never holds up dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use buildlane_core::{AgentEvent, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delivers agent events to operators.
#[async_trait]
pub trait AgentNotifier: Send + Sync {
    async fn notify(&self, event: &AgentEvent) -> Result<()>;
}

/// Notifier that writes events to the log.
pub struct LogNotifier;

#[async_trait]
impl AgentNotifier for LogNotifier {
    async fn notify(&self, event: &AgentEvent) -> Result<()> {
        match event {
            AgentEvent::SelfPaused {
                agent,
                consecutive_failures,
                at,
            } => {
                warn!(
                    agent = %agent.short_name,
                    address = %agent.member_address,
                    consecutive_failures,
                    at = %at,
                    "Build agent paused itself after consecutive failed build jobs"
                );
            }
            AgentEvent::Resumed { agent, at } => {
                info!(
                    agent = %agent.short_name,
                    address = %agent.member_address,
                    at = %at,
                    "Build agent resumed"
                );
            }
        }
        Ok(())
    }
}

/// Sending half of the event outbox.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: AgentEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(agent = %e.0.agent().short_name, "Notifier is gone, dropping agent event");
        }
    }
}

/// Drain the outbox until every sender is dropped.
pub async fn run_notifier(
    mut rx: mpsc::UnboundedReceiver<AgentEvent>,
    notifier: Arc<dyn AgentNotifier>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = notifier.notify(&event).await {
            warn!(agent = %event.agent().short_name, error = %e, "Failed to deliver agent event");
        }
    }
    debug!("Notifier stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingNotifier, test_agent};
    use buildlane_core::Error;
    use chrono::Utc;

    struct FailingNotifier;

    #[async_trait]
    impl AgentNotifier for FailingNotifier {
        async fn notify(&self, _event: &AgentEvent) -> Result<()> {
            Err(Error::Internal("mail server down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_notifier_receives_events_in_order() {
        let (outbox, rx) = Outbox::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let agent = test_agent("agent-1");

        outbox.publish(AgentEvent::SelfPaused {
            agent: agent.clone(),
            consecutive_failures: 3,
            at: Utc::now(),
        });
        outbox.publish(AgentEvent::Resumed {
            agent,
            at: Utc::now(),
        });
        drop(outbox);

        run_notifier(rx, notifier.clone()).await;
        let events = notifier.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AgentEvent::SelfPaused { .. }));
        assert!(matches!(events[1], AgentEvent::Resumed { .. }));
    }

    #[tokio::test]
    async fn test_failing_notifier_keeps_draining() {
        let (outbox, rx) = Outbox::new();
        for _ in 0..3 {
            outbox.publish(AgentEvent::Resumed {
                agent: test_agent("agent-1"),
                at: Utc::now(),
            });
        }
        drop(outbox);
        run_notifier(rx, Arc::new(FailingNotifier)).await;
    }

    #[tokio::test]
    async fn test_publish_without_receiver_does_not_panic() {
        let (outbox, rx) = Outbox::new();
        drop(rx);
        outbox.publish(AgentEvent::Resumed {
            agent: test_agent("agent-1"),
            at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_all_events() {
        let agent = test_agent("agent-1");
        LogNotifier
            .notify(&AgentEvent::SelfPaused {
                agent: agent.clone(),
                consecutive_failures: 5,
                at: Utc::now(),
            })
            .await
            .unwrap();
        LogNotifier
            .notify(&AgentEvent::Resumed {
                agent,
                at: Utc::now(),
            })
            .await
            .unwrap();
    }
}
