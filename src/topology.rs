//! Exchanges, queues and routing keys shared with the other services.

use rabbitmq::{ExchangeKind, RabbitMQError, Topology};

pub const PAYMENT_EXCHANGE: &str = "paymentexchange";
pub const ORDER_EXCHANGE: &str = "orderexchange";

pub const PAYMENT_REQUEST: &str = "payment.request";
pub const PAYMENT_PROCESSING: &str = "payment.processing";
pub const PAYMENT_CONFIRMED: &str = "payment.confirmed";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const PAYMENT_REFUND: &str = "payment.refund";
pub const PAYMENT_REFUND_PROCESSED: &str = "payment.refund.processed";

/// Routing key of the notification sent to the order service once a payment is confirmed.
pub const ORDER_PAID: &str = "order.paid";

/// Every payment queue, each bound to the payment exchange under its own name.
pub const PAYMENT_QUEUES: [&str; 6] = [
    PAYMENT_REQUEST,
    PAYMENT_PROCESSING,
    PAYMENT_CONFIRMED,
    PAYMENT_FAILED,
    PAYMENT_REFUND,
    PAYMENT_REFUND_PROCESSED,
];

pub fn payment_topology() -> Result<Topology, RabbitMQError> {
    let mut builder = Topology::builder()
        .exchange(PAYMENT_EXCHANGE, ExchangeKind::Topic, true)
        .exchange(ORDER_EXCHANGE, ExchangeKind::Topic, true);
    for queue in PAYMENT_QUEUES {
        builder = builder.queue(queue, true).bind(queue, PAYMENT_EXCHANGE, queue);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_queue_is_bound_under_its_own_name() {
        let topology = payment_topology().unwrap();
        assert_eq!(topology.exchanges().len(), 2);
        assert_eq!(topology.queue_names(), PAYMENT_QUEUES.to_vec());
        for binding in topology.bindings() {
            assert_eq!(binding.exchange, PAYMENT_EXCHANGE);
            assert_eq!(binding.queue, binding.routing_key);
        }
        assert!(topology.exchanges().iter().all(|e| e.durable));
        assert!(topology.queues().iter().all(|q| q.durable));
    }
}
