//! Delivery processor used by the consumer service.

use amqp_worker::{Delivery, DeliveryProcessor, ProcessingError};
use async_trait::async_trait;
use tracing::info;

/// Logs every delivery.
///
/// Deliveries declared as JSON (`content_type: application/json`) whose body
/// is not valid JSON are rejected without requeue.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProcessor;

#[async_trait]
impl DeliveryProcessor for LoggingProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        let is_json = delivery
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.eq_ignore_ascii_case("application/json"));

        if is_json {
            delivery.json::<serde_json::Value>().map_err(|e| {
                ProcessingError::permanent(format!("invalid JSON body: {e}"))
            })?;
        }

        info!(
            delivery_tag = delivery.delivery_tag,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered,
            message_id = ?delivery.message_id,
            correlation_id = ?delivery.correlation_id,
            bytes = delivery.payload.len(),
            "Received delivery"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingProcessor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_worker::ErrorCategory;

    #[tokio::test]
    async fn test_accepts_plain_payload() {
        let delivery = Delivery::new(1, "orders", b"not json".to_vec());
        assert!(LoggingProcessor.process(&delivery).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_malformed_json_permanently() {
        let mut delivery = Delivery::new(1, "orders", b"{oops".to_vec());
        delivery.content_type = Some("application/json".to_string());

        let err = LoggingProcessor.process(&delivery).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[tokio::test]
    async fn test_accepts_valid_json() {
        let mut delivery = Delivery::new(1, "orders", br#"{"id":1}"#.to_vec());
        delivery.content_type = Some("application/json".to_string());

        assert!(LoggingProcessor.process(&delivery).await.is_ok());
    }
}
