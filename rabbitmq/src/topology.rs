use std::{collections::HashSet, fmt};

use tracing::debug;

use crate::{RabbitMQError, transport::BrokerChannel};

/// AMQP exchange types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    /// Routing keys are matched against binding patterns:
    /// - "*" (star) can substitute for exactly one word
    /// - "#" (hash) can substitute for zero or more words
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Static description of the exchanges, queues and bindings a service relies on.
///
/// The descriptor is declared on every (re)connection. Declarations are idempotent on the
/// broker side, so declaring the same topology twice leaves the broker unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<Binding>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.queues.iter().map(|q| q.name.as_str()).collect()
    }

    /// Declares exchanges, then queues, then bindings on the given channel.
    ///
    /// Bindings go last because they require both ends to exist.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), RabbitMQError> {
        for exchange in &self.exchanges {
            debug!("declaring exchange {} ({})", exchange.name, exchange.kind);
            channel.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            debug!("declaring queue {}", queue.name);
            channel.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            debug!(
                "binding queue {} to {} with key {}",
                binding.queue, binding.exchange, binding.routing_key
            );
            channel.bind_queue(binding).await?;
        }
        Ok(())
    }
}

/// Builder for [`Topology`]; `build()` rejects bindings that reference undeclared names.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    topology: Topology,
}

impl TopologyBuilder {
    pub fn exchange(mut self, name: &str, kind: ExchangeKind, durable: bool) -> Self {
        self.topology.exchanges.push(ExchangeSpec {
            name: name.to_owned(),
            kind,
            durable,
        });
        self
    }

    pub fn queue(mut self, name: &str, durable: bool) -> Self {
        self.topology.queues.push(QueueSpec {
            name: name.to_owned(),
            durable,
        });
        self
    }

    pub fn bind(mut self, queue: &str, exchange: &str, routing_key: &str) -> Self {
        self.topology.bindings.push(Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        self
    }

    pub fn build(self) -> Result<Topology, RabbitMQError> {
        let topology = self.topology;

        let mut exchange_names = HashSet::new();
        for exchange in &topology.exchanges {
            if !exchange_names.insert(exchange.name.as_str()) {
                return Err(RabbitMQError::InvalidTopology(format!(
                    "exchange `{}` declared twice",
                    exchange.name
                )));
            }
        }
        let mut queue_names = HashSet::new();
        for queue in &topology.queues {
            if !queue_names.insert(queue.name.as_str()) {
                return Err(RabbitMQError::InvalidTopology(format!(
                    "queue `{}` declared twice",
                    queue.name
                )));
            }
        }
        for binding in &topology.bindings {
            if !exchange_names.contains(binding.exchange.as_str()) {
                return Err(RabbitMQError::InvalidTopology(format!(
                    "binding references unknown exchange `{}`",
                    binding.exchange
                )));
            }
            if !queue_names.contains(binding.queue.as_str()) {
                return Err(RabbitMQError::InvalidTopology(format!(
                    "binding references unknown queue `{}`",
                    binding.queue
                )));
            }
        }

        Ok(topology)
    }
}

/// Matches a routing key against a topic binding pattern.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && match_words(rest, key_rest),
            None => false,
        },
    }
}
