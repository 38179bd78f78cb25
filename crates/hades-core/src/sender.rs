//! The [`RecordSender`] trait is how collectors hand records to the uploader.
//!
//! [`RecordSender::send`] must not block since it is called from async contexts.

use tokio::sync::mpsc;

use crate::record::Record;

/// Error returned when the consumer side of the output channel is gone.
#[derive(Debug, thiserror::Error)]
#[error("record channel closed")]
pub struct SendError;

pub trait RecordSender: Clone + Send + Sync + 'static {
    /// Must not block since it can be used in async contexts
    fn send(&self, record: Record) -> Result<(), SendError>;
}

/// The output channel is unbounded: a slow uploader grows memory instead of
/// stalling the perf buffer drain.
impl RecordSender for mpsc::UnboundedSender<Record> {
    fn send(&self, record: Record) -> Result<(), SendError> {
        mpsc::UnboundedSender::send(self, record).map_err(|_| SendError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbounded_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        RecordSender::send(&tx, Record::buffer_overflow(1)).unwrap();
        let record = rx.recv().await.unwrap();
        assert_eq!(record.data_type, crate::record::DataType::BufferOverflow);
        drop(rx);
        assert!(RecordSender::send(&tx, Record::buffer_overflow(1)).is_err());
    }
}
