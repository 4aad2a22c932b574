use crate::error::Error;
use crate::runtime::Pglite;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:2678";

/// One backend shared by every request; statements run one at a time.
#[derive(Clone)]
pub struct AppState {
    pg: Arc<Mutex<Pglite>>,
}

impl AppState {
    pub fn new(pg: Pglite) -> Self {
        Self {
            pg: Arc::new(Mutex::new(pg)),
        }
    }
}

#[derive(Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

#[derive(Serialize, Debug)]
pub struct QueryResponse {
    pub stdout: String,
    pub stderr: String,
    pub cost: String,
    pub trace_id: String,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub initdb_status: i32,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/query", post(query_handler))
        .with_state(state)
}

pub async fn serve(pg: Pglite, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(AppState::new(pg));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pg = state.pg.lock().await;
    let (code, status) = if pg.is_exited() {
        (StatusCode::SERVICE_UNAVAILABLE, "exited")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        code,
        Json(HealthResponse {
            status,
            initdb_status: pg.initdb_status(),
        }),
    )
}

async fn query_handler(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, String)> {
    let trace_id = Uuid::now_v7().simple().to_string();

    let started = Instant::now();
    let mut pg = state.pg.lock().await;
    // Drop anything left over from an earlier failed request.
    pg.take_output();

    if let Err(err) = pg.query(&req.sql).await {
        error!(%trace_id, "query failed: {err}");
        let code = match err {
            Error::InteriorNul(_) | Error::SqlTooLarge { .. } => StatusCode::BAD_REQUEST,
            Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return Err((code, err.to_string()));
    }

    let output = pg.take_output().unwrap_or_default();
    Ok(Json(QueryResponse {
        stdout: output.stdout,
        stderr: output.stderr,
        cost: format!("{}ms", started.elapsed().as_millis()),
        trace_id,
    }))
}
