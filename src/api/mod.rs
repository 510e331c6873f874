//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the REST API of the payment service using Axum.
// It stores payment records, turns them into broker requests and reports the broker link.
//
// | Component      | Description                                                |
// |----------------|-----------------------------------------------------------|
// | API            | Main API structure coordinating routes and services        |
// | Routes         | Handler functions for API endpoints                        |
// | States         | Shared application state                                   |
// | DTOs           | Data transfer objects for API requests/responses           |
//
//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name           | Description                                       | Key Methods       |
// |----------------|---------------------------------------------------|------------------|
// | AppState       | Shared application state                         | new               |
// | Api            | Main API structure                               | routes, serve     |
// | Error          | API error types                                  | from              |
//--------------------------------------------------------------------------------------------------

mod dto;
mod error;
mod routes;

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Extension, Router,
    http::{HeaderValue, Method, header},
    routing::{get, post},
};
use rabbitmq::ConnectionManager;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    domain::services::payment_repository::PaymentRepository, outbounds::event_sink::EventSink,
};

pub use dto::*;
pub use error::{ApiError, ApiResult};

const ALLOWED_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:3001",
    "http://127.0.0.1:3001",
];

/// Shared application state accessible by all handlers
pub struct AppState {
    pub repository: Arc<dyn PaymentRepository>,
    pub sink: Arc<dyn EventSink>,
    /// Broker connection, used only for status reports
    pub manager: ConnectionManager,
}

impl AppState {
    pub fn new(
        repository: Arc<dyn PaymentRepository>,
        sink: Arc<dyn EventSink>,
        manager: ConnectionManager,
    ) -> Self {
        Self {
            repository,
            sink,
            manager,
        }
    }
}

/// Main API structure
pub struct Api {
    /// API address
    addr: SocketAddr,
    /// Shared application state
    state: Arc<AppState>,
}

impl Api {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            state: Arc::new(state),
        }
    }

    /// Creates all routes for the API
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(
                ALLOWED_ORIGINS
                    .iter()
                    .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
            .allow_credentials(true);

        Router::new()
            .route("/", get(routes::root))
            // Payments
            .route(
                "/api/payments",
                post(routes::create_payment).get(routes::list_payments),
            )
            .route(
                "/api/payments/:id",
                get(routes::get_payment).put(routes::update_payment),
            )
            .route("/api/payments/:id/refund", post(routes::refund_payment))
            // Broker diagnostics
            .route("/api/payments/test/rabbitmq", get(routes::broker_status))
            .layer(Extension(self.state.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    /// Starts the API server and runs until `shutdown` resolves
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let app = self.routes();

        info!("API listening on {}", self.addr);
        let listener = TcpListener::bind(self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
