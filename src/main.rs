use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use rabbitmq::{ConnectionManager, Consumer, MessageHandler};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use payment_service::{
    Config, InMemoryPaymentRepository, PaymentRequestHandler, RabbitEventSink,
    RefundRequestHandler, SimulatedGateway,
    api::{Api, AppState},
    topology::{PAYMENT_REFUND, PAYMENT_REQUEST, payment_topology},
};

#[derive(Parser, Debug)]
#[command(name = "payment-service", about = "Payment processing service")]
struct Opt {
    /// API server port, overrides PORT
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::try_from_env().context("invalid configuration")?;
    let topology = payment_topology().context("invalid broker topology")?;

    info!("Starting payment service");

    let manager = ConnectionManager::builder(config.endpoint(), topology)
        .reconnect_policy(config.reconnect_policy())
        .liveness_interval(config.liveness_interval)
        .build();

    // The manager keeps retrying in the background; the API is useful without the broker.
    if let Err(e) = manager.connect().await {
        warn!("Initial broker connection failed: {}", e);
    }

    let sink = Arc::new(RabbitEventSink::new(manager.clone(), &config.app_id));
    let gateway = Arc::new(SimulatedGateway::new(config.payment_limit));

    let consumer = Consumer::new(manager.clone());
    let handlers: [(&str, Arc<dyn MessageHandler>); 2] = [
        (
            PAYMENT_REQUEST,
            Arc::new(PaymentRequestHandler::new(gateway.clone(), sink.clone())),
        ),
        (
            PAYMENT_REFUND,
            Arc::new(RefundRequestHandler::new(gateway, sink.clone())),
        ),
    ];
    for (queue, handler) in handlers {
        if let Err(e) = consumer.consume(queue, handler).await {
            // Registered subscriptions start once the connection is back.
            error!("Could not start consuming {}: {}", queue, e);
        }
    }

    let port = opt.port.unwrap_or(config.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = AppState::new(
        Arc::new(InMemoryPaymentRepository::new()),
        sink,
        manager.clone(),
    );
    let api = Api::new(addr, state);

    info!("Payment service listening on http://{}", addr);
    api.serve(async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
    })
    .await
    .context("API server error")?;

    manager.shutdown().await;
    info!("Payment service stopped");
    Ok(())
}
