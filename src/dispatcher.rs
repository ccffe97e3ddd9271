use crate::{ble::TreadmillLink, protocol};
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Frames the writer task may hold before heartbeats are skipped
pub const WRITER_QUEUE_DEPTH: usize = 8;

/// Frame chosen for one notification cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// The pending command frame
    Command(Bytes),
    /// Keep-alive frame
    Heartbeat,
}

impl Outbound {
    /// Wire bytes of this frame
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Command(frame) => frame.clone(),
            Self::Heartbeat => protocol::heartbeat(),
        }
    }

    /// Check if this is a command frame
    #[must_use]
    pub const fn is_command(&self) -> bool {
        matches!(self, Self::Command(_))
    }
}

/// Single pending-command slot drained by the notification heartbeat
///
/// The device only accepts writes in step with its own notifications, so every
/// command waits here until the next one arrives. A newer command replaces an
/// unsent older one.
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: Mutex<Option<Bytes>>,
}

impl Dispatcher {
    /// Create an empty dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending command
    pub fn enqueue(&self, frame: Bytes) {
        let replaced = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(frame);

        if let Some(old) = replaced {
            debug!("Dropping unsent command {:02X?}", old.as_ref());
        }
    }

    /// Take the pending command, or fall back to a heartbeat
    pub fn next_outbound(&self) -> Outbound {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map_or(Outbound::Heartbeat, Outbound::Command)
    }

    /// Check if a command is waiting for the next notification
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drop the pending command, if any
    pub fn clear(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Run one notification cycle: hand the next frame to the writer
    ///
    /// When the writer queue is full the heartbeat is skipped and a command goes
    /// back into the slot for the next cycle.
    pub fn dispatch(&self, writer: &FrameWriter) -> Outbound {
        let outbound = self.next_outbound();
        match writer.submit(outbound.clone()) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(Outbound::Command(frame))) => {
                debug!("Frame writer busy, keeping command pending");
                self.restore(frame);
            }
            Err(TrySendError::Full(Outbound::Heartbeat)) => {
                debug!("Frame writer busy, skipping heartbeat");
            }
        }
        outbound
    }

    /// Put a command back unless a newer one was queued meanwhile
    fn restore(&self, frame: Bytes) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(frame);
    }
}

/// Single writer for the write characteristic
///
/// Frames are written one at a time in submission order by a dedicated task, so
/// two notification cycles never have overlapping writes in flight. Submitting
/// never waits for the write to complete, and at most [`WRITER_QUEUE_DEPTH`]
/// frames wait behind a stalled write.
#[derive(Debug)]
pub struct FrameWriter {
    tx: mpsc::Sender<Outbound>,
    task: JoinHandle<()>,
}

impl FrameWriter {
    /// Spawn the writer task for a link
    #[must_use]
    pub fn spawn(link: Arc<dyn TreadmillLink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Outbound>(WRITER_QUEUE_DEPTH);

        let task = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let frame = outbound.to_bytes();
                debug!("Sending {:02X?}", frame.as_ref());

                // Failed frames are not retried: a heartbeat is simply lost and a
                // command has already left the pending slot.
                if let Err(e) = link.write(&frame).await {
                    if outbound.is_command() {
                        warn!("Failed to send pending command: {e}");
                    } else {
                        warn!("Failed to send heartbeat: {e}");
                    }
                }
            }
            debug!("Frame writer stopped");
        });

        Self { tx, task }
    }

    /// Queue a frame for writing
    ///
    /// # Errors
    ///
    /// Hands the frame back if the queue is full or the writer task has stopped.
    pub fn submit(&self, outbound: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.tx.try_send(outbound).inspect_err(|e| {
            if let TrySendError::Closed(_) = e {
                warn!("Frame writer is gone, dropping frame");
            }
        })
    }

    /// Stop accepting frames and wait for queued writes to finish
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!("Frame writer task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{PitPatError, Result},
        protocol::{encode, CommandKind},
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct RecordingLink {
        written: mpsc::UnboundedSender<Vec<u8>>,
        fail: bool,
    }

    #[async_trait]
    impl TreadmillLink for RecordingLink {
        async fn write(&self, data: &[u8]) -> Result<()> {
            // Slow writes make overlapping submissions observable
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = self.written.send(data.to_vec());
            if self.fail {
                return Err(PitPatError::WriteFailed("rejected".to_string()));
            }
            Ok(())
        }
    }

    struct StalledLink;

    #[async_trait]
    impl TreadmillLink for StalledLink {
        async fn write(&self, _data: &[u8]) -> Result<()> {
            std::future::pending().await
        }
    }

    fn recording_link(fail: bool) -> (Arc<dyn TreadmillLink>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (written, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingLink { written, fail }), rx)
    }

    #[test]
    fn test_heartbeat_when_idle() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.next_outbound(), Outbound::Heartbeat);
        assert_eq!(
            Outbound::Heartbeat.to_bytes().as_ref(),
            &protocol::HEARTBEAT
        );
    }

    #[test]
    fn test_pending_slot_last_writer_wins() {
        let dispatcher = Dispatcher::new();
        let start = encode(CommandKind::Start, 1000);
        let speed = encode(CommandKind::SetSpeed, 3000);

        dispatcher.enqueue(start);
        dispatcher.enqueue(speed.clone());
        assert!(dispatcher.has_pending());

        assert_eq!(dispatcher.next_outbound(), Outbound::Command(speed));
        assert!(!dispatcher.has_pending());
        assert_eq!(dispatcher.next_outbound(), Outbound::Heartbeat);
    }

    #[test]
    fn test_slot_empty_iff_command_sent() {
        let dispatcher = Dispatcher::new();

        let outbound = dispatcher.next_outbound();
        assert!(!outbound.is_command());
        assert!(!dispatcher.has_pending());

        dispatcher.enqueue(encode(CommandKind::Pause, 1000));
        let outbound = dispatcher.next_outbound();
        assert!(outbound.is_command());
        assert!(!dispatcher.has_pending());
    }

    #[test]
    fn test_clear() {
        let dispatcher = Dispatcher::new();
        dispatcher.enqueue(encode(CommandKind::Stop, 1000));
        dispatcher.clear();
        assert_eq!(dispatcher.next_outbound(), Outbound::Heartbeat);
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (link, mut written) = recording_link(false);
        let writer = FrameWriter::spawn(link);
        let dispatcher = Dispatcher::new();

        let start = encode(CommandKind::Start, 1000);
        dispatcher.dispatch(&writer);
        dispatcher.enqueue(start.clone());
        dispatcher.dispatch(&writer);
        dispatcher.dispatch(&writer);
        writer.shutdown().await;

        assert_eq!(written.recv().await.unwrap(), protocol::HEARTBEAT.to_vec());
        assert_eq!(written.recv().await.unwrap(), start.to_vec());
        assert_eq!(written.recv().await.unwrap(), protocol::HEARTBEAT.to_vec());
        assert!(written.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_command_is_not_retried() {
        let (link, mut written) = recording_link(true);
        let writer = FrameWriter::spawn(link);
        let dispatcher = Dispatcher::new();

        let stop = encode(CommandKind::Stop, 1000);
        dispatcher.enqueue(stop.clone());
        assert!(dispatcher.dispatch(&writer).is_command());
        assert!(!dispatcher.has_pending());
        assert_eq!(dispatcher.dispatch(&writer), Outbound::Heartbeat);
        writer.shutdown().await;

        assert_eq!(written.recv().await.unwrap(), stop.to_vec());
        assert_eq!(written.recv().await.unwrap(), protocol::HEARTBEAT.to_vec());
        assert!(written.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_writer_skips_heartbeats_and_keeps_command() {
        let writer = FrameWriter::spawn(Arc::new(StalledLink));
        let dispatcher = Dispatcher::new();

        // Let the writer pick up the first frame and hang on it
        dispatcher.dispatch(&writer);
        tokio::task::yield_now().await;

        for _ in 0..WRITER_QUEUE_DEPTH * 4 {
            assert_eq!(dispatcher.dispatch(&writer), Outbound::Heartbeat);
        }
        assert!(matches!(
            writer.submit(Outbound::Heartbeat),
            Err(TrySendError::Full(Outbound::Heartbeat))
        ));

        let start = encode(CommandKind::Start, 1000);
        dispatcher.enqueue(start.clone());
        assert!(dispatcher.dispatch(&writer).is_command());
        assert_eq!(dispatcher.next_outbound(), Outbound::Command(start));
    }

    #[test]
    fn test_restore_keeps_newer_command() {
        let dispatcher = Dispatcher::new();
        let stop = encode(CommandKind::Stop, 1000);

        dispatcher.enqueue(stop.clone());
        dispatcher.restore(encode(CommandKind::Start, 1000));
        assert_eq!(dispatcher.next_outbound(), Outbound::Command(stop));
    }
}
