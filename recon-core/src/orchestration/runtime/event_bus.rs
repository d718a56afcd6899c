use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::Result;
use crate::orchestration::events::{BusMessage, EventFilter, ScanEvent, ScanEventPublisher};

/// Subscription handle returned by [`InProcEventBus::subscribe`].
pub type EventStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

/// Lightweight in-process event bus that fans out store notifications to
/// observers inside the process. Each subscriber owns a bounded ring; a slow
/// subscriber loses its oldest events and receives a `Lagging` marker, and
/// publishers never wait.
pub struct InProcEventBus {
    sender: broadcast::Sender<ScanEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let message = match item {
                Ok(event) if filter.matches(&event) => Some(BusMessage::Event(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::debug!(target: "recon::store", skipped, "event subscriber lagging");
                    Some(BusMessage::Lagging { skipped })
                }
            };
            futures::future::ready(message)
        });
        Box::pin(stream)
    }
}

#[async_trait]
impl ScanEventPublisher for InProcEventBus {
    async fn publish(&self, event: ScanEvent) -> Result<()> {
        // No receivers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use recon_model::{JobId, ScanType, Target};

    use super::*;
    use crate::orchestration::events::ScanEventKind;

    fn progress(job_id: JobId, value: u8) -> ScanEvent {
        ScanEvent {
            job_id,
            scan_type: ScanType::PortScan,
            target: Target::parse("10.1.1.1").unwrap(),
            revision: value as u64,
            at: Utc::now(),
            kind: ScanEventKind::ProgressUpdated { value },
        }
    }

    #[tokio::test]
    async fn overflow_yields_lagging_then_newest_events() {
        let bus = InProcEventBus::new(4);
        let mut stream = bus.subscribe(EventFilter::all());
        let job_id = JobId::new();

        for value in 0..10 {
            bus.publish(progress(job_id, value)).await.unwrap();
        }

        assert_eq!(
            stream.next().await,
            Some(BusMessage::Lagging { skipped: 6 })
        );
        let mut seen = Vec::new();
        for _ in 0..4 {
            match stream.next().await {
                Some(BusMessage::Event(event)) => seen.push(event.revision),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn filtered_subscribers_only_see_their_job() {
        let bus = InProcEventBus::new(16);
        let wanted = JobId::new();
        let mut stream = bus.subscribe(EventFilter::for_job(wanted));

        bus.publish(progress(JobId::new(), 1)).await.unwrap();
        bus.publish(progress(wanted, 2)).await.unwrap();

        match stream.next().await {
            Some(BusMessage::Event(event)) => assert_eq!(event.job_id, wanted),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = InProcEventBus::new(1);
        bus.publish(progress(JobId::new(), 1)).await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
