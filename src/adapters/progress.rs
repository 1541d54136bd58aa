//! Progress emitters for the transport layer.

use tokio::sync::mpsc;
use tracing::info;

use super::{EmitError, ProgressEmitter};
use crate::domain::ProgressEvent;

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

impl ProgressEmitter for NoopEmitter {
    fn emit(&self, _event: &ProgressEvent) -> Result<(), EmitError> {
        Ok(())
    }
}

/// Logs events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl ProgressEmitter for TracingEmitter {
    fn emit(&self, event: &ProgressEvent) -> Result<(), EmitError> {
        info!(
            thread_id = %event.thread_id,
            node = %event.node,
            step_id = ?event.step_id,
            event_type = ?event.event_type,
            "{}",
            event.summary
        );
        Ok(())
    }
}

/// Forwards events over a bounded channel; drops them when the consumer lags
pub struct ChannelEmitter {
    sender: mpsc::Sender<ProgressEvent>,
}

impl ChannelEmitter {
    /// Create an emitter and the receiving end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl ProgressEmitter for ChannelEmitter {
    fn emit(&self, event: &ProgressEvent) -> Result<(), EmitError> {
        self.sender
            .try_send(event.clone())
            .map_err(|e| EmitError(e.to_string()))
    }
}

/// Fans one event out to several emitters
#[derive(Default)]
pub struct FanoutEmitter {
    emitters: Vec<Box<dyn ProgressEmitter>>,
}

impl FanoutEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, emitter: impl ProgressEmitter + 'static) -> Self {
        self.emitters.push(Box::new(emitter));
        self
    }
}

impl ProgressEmitter for FanoutEmitter {
    fn emit(&self, event: &ProgressEvent) -> Result<(), EmitError> {
        let failures: Vec<String> = self
            .emitters
            .iter()
            .filter_map(|e| e.emit(event).err().map(|err| err.to_string()))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EmitError(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventType;

    fn event() -> ProgressEvent {
        ProgressEvent::new("t", "supervisor", EventType::StepStarted, "step 1")
    }

    #[tokio::test]
    async fn test_channel_emitter_delivers() {
        let (emitter, mut rx) = ChannelEmitter::new(4);
        emitter.emit(&event()).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::StepStarted);
    }

    #[test]
    fn test_channel_emitter_never_blocks_when_full() {
        let (emitter, _rx) = ChannelEmitter::new(1);
        assert!(emitter.emit(&event()).is_ok());
        // Second send fails instead of waiting
        assert!(emitter.emit(&event()).is_err());
    }

    #[test]
    fn test_fanout_reports_partial_failure() {
        let (full, _rx) = ChannelEmitter::new(1);
        full.emit(&event()).unwrap();

        let fanout = FanoutEmitter::new().with(NoopEmitter).with(full);
        assert!(fanout.emit(&event()).is_err());
    }
}
