//! Delivery processing contract.

use crate::broker::Delivery;
use crate::error::ProcessingError;
use async_trait::async_trait;

/// Trait for delivery processors.
///
/// Domain handlers implement this trait to process messages consumed from the
/// queue. Every worker of a manager shares the same processor, so
/// implementations must tolerate concurrent calls.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_worker::{Delivery, DeliveryProcessor, ProcessingError};
///
/// struct InvoiceProcessor;
///
/// #[async_trait]
/// impl DeliveryProcessor for InvoiceProcessor {
///     async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
///         let invoice: Invoice = delivery.json()?;
///         billing::record(invoice).await.map_err(|e| ProcessingError::transient(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "InvoiceProcessor"
///     }
/// }
/// ```
#[async_trait]
pub trait DeliveryProcessor: Send + Sync + 'static {
    /// Process a single delivery.
    ///
    /// `Ok(())` acks the delivery. An error rejects it, requeueing unless the
    /// error is permanent.
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError>;

    /// Get the processor name for logging.
    fn name(&self) -> &'static str;
}

/// How a processed delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Reject { requeue: bool },
}

impl Acknowledgement {
    /// Acknowledgement for a processing result
    pub fn for_result(result: &Result<(), ProcessingError>) -> Self {
        match result {
            Ok(()) => Acknowledgement::Ack,
            Err(e) => Acknowledgement::Reject {
                requeue: e.category().requeue(),
            },
        }
    }
}

/// Processor that accepts every delivery without looking at it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProcessor;

#[async_trait]
impl DeliveryProcessor for NoOpProcessor {
    async fn process(&self, _delivery: &Delivery) -> Result<(), ProcessingError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "NoOpProcessor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledgement_for_result() {
        assert_eq!(Acknowledgement::for_result(&Ok(())), Acknowledgement::Ack);
        assert_eq!(
            Acknowledgement::for_result(&Err(ProcessingError::transient("db down"))),
            Acknowledgement::Reject { requeue: true }
        );
        assert_eq!(
            Acknowledgement::for_result(&Err(ProcessingError::rate_limited("429"))),
            Acknowledgement::Reject { requeue: true }
        );
        assert_eq!(
            Acknowledgement::for_result(&Err(ProcessingError::permanent("bad payload"))),
            Acknowledgement::Reject { requeue: false }
        );
    }

    #[tokio::test]
    async fn test_noop_processor() {
        let delivery = Delivery::new(1, "orders", b"{}".to_vec());
        assert!(NoOpProcessor.process(&delivery).await.is_ok());
        assert_eq!(NoOpProcessor.name(), "NoOpProcessor");
    }
}
