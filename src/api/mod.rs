//! HTTP surface owned by the coordination fabric
//!
//! Only the agent-facing endpoints live here; the admin CRUD surface is an
//! external collaborator that mounts its own routes alongside.
//!
//! - `GET /api/agent/ws` — agent WebSocket upgrade
//! - `GET /api/scripts/:id/content` — script body for the script executor
//! - `GET /api/health` — liveness + online agent count

pub mod error;
pub mod routes;

pub use error::{ApiError, ApiResult};

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::hub::handler::{agent_ws, CoreState};

/// Build the fabric's router. The caller owns binding and serving so the
/// external admin layer can merge its routes into the same server.
pub fn router(state: CoreState, enable_cors: bool) -> Router {
    let mut app = Router::new()
        .route("/api/agent/ws", get(agent_ws))
        .route("/api/scripts/:id/content", get(routes::script_content))
        .route("/api/health", get(routes::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app
}
