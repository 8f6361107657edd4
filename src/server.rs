// HTTP surface: the update trigger, a health check, and read-only views of the stored data.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{IngestError, Result};
use crate::loader::VERSION_FIELD;
use crate::pipeline::Pipeline;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        AppState {
            pipeline: Arc::new(pipeline),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    fn store(&self) -> &Store {
        self.pipeline.store()
    }
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

// ============================================================================
// Trigger & health
// ============================================================================

async fn trigger_update(state: web::Data<AppState>) -> HttpResponse {
    let Ok(_guard) = state.run_lock.try_lock() else {
        warn!("Update requested while another run is in flight");
        return HttpResponse::Conflict()
            .json(serde_json::json!({ "error": "An update is already running" }));
    };

    info!("Update triggered over HTTP");
    match state.pipeline.run().await {
        Ok(outcome) if outcome.updated => HttpResponse::Ok().json(outcome),
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "updated": false })),
        Err(e) => {
            error!(error = %e, "Update run failed");
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    match state.store().ping().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "store": "connected",
            "timestamp": chrono::Utc::now().timestamp(),
        })),
        Err(e) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "unhealthy",
            "store": e.to_string(),
            "timestamp": chrono::Utc::now().timestamp(),
        })),
    }
}

// ============================================================================
// Read-only data endpoints
// ============================================================================

fn strip_version(mut documents: Vec<Value>) -> Vec<Value> {
    for doc in &mut documents {
        if let Some(map) = doc.as_object_mut() {
            map.remove(VERSION_FIELD);
        }
    }
    documents
}

async fn collections_ending_with(store: &Store, suffix: &str) -> Result<Vec<String>> {
    let suffix = format!("_{suffix}");
    Ok(store
        .list_collections()
        .await?
        .into_iter()
        .filter(|c| c.ends_with(&suffix))
        .collect())
}

async fn gather(store: &Store, file_type: &str, filter: Option<(&str, &str)>) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for collection in collections_ending_with(store, file_type).await? {
        documents.extend(store.find_documents(&collection, filter).await?);
    }
    Ok(strip_version(documents))
}

fn respond<T: Serialize>(result: Result<T>, what: &str) -> HttpResponse {
    match result {
        Ok(data) => HttpResponse::Ok().json(ApiResponse::success(data)),
        Err(e) => {
            error!(error = %e, "Failed to retrieve {}", what);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Failed to retrieve {what}")))
        }
    }
}

async fn get_version(state: web::Data<AppState>) -> HttpResponse {
    respond(state.store().get_version().await, "version")
}

async fn get_routes(state: web::Data<AppState>) -> HttpResponse {
    respond(gather(state.store(), "routes", None).await, "routes")
}

async fn get_route_trips(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let route_id = path.into_inner();
    respond(
        gather(state.store(), "trips", Some(("route_id", route_id.as_str()))).await,
        "trips",
    )
}

async fn get_route_shapes(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let route_id = path.into_inner();
    let store = state.store();

    let result = async {
        let mut shapes = Vec::new();
        for collection in collections_ending_with(store, "trips").await? {
            for shape in store
                .distinct_values(&collection, "shape_id", "route_id", &route_id)
                .await?
            {
                if !shapes.contains(&shape) {
                    shapes.push(shape);
                }
            }
        }
        Ok::<_, IngestError>(shapes)
    }
    .await;

    respond(result, "route shapes")
}

async fn get_shape(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let shape_id = path.into_inner();
    respond(
        gather(state.store(), "shapes", Some(("shape_id", shape_id.as_str()))).await,
        "shape",
    )
}

/// Route table, shared by the server and the handler tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/update", web::post().to(trigger_update))
        .route("/health", web::get().to(health_check))
        .route("/version", web::get().to(get_version))
        .route("/routes", web::get().to(get_routes))
        .route("/routes/{route_id}/trips", web::get().to(get_route_trips))
        .route("/routes/{route_id}/shapes", web::get().to(get_route_shapes))
        .route("/shapes/{shape_id}", web::get().to(get_shape));
}

pub async fn run_server(state: AppState, host: &str, port: u16) -> std::io::Result<()> {
    info!(host, port, "GTFS schedule sync listening");
    info!("Routes: POST /update, GET /health, GET /version, GET /routes, \
           GET /routes/{{id}}/trips, GET /routes/{{id}}/shapes, GET /shapes/{{id}}");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((host, port))?
    .run()
    .await
}
