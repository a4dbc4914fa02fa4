//! AMQP Consumer Service - Entry Point
//!
//! Consumes a RabbitMQ queue with a pool of parallel workers.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_amqp_consumer::run().await
}
