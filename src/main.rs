// X-trafik live bus tracker backend
// Resolves GTFS-RT vehicles to line numbers via a cached static GTFS dataset
//
// Samtrafiken/Trafiklab endpoints:
// - GTFS-RT vehicles: https://opendata.samtrafiken.se/gtfs-rt/xt/VehiclePositions.pb
// - GTFS static:      https://opendata.samtrafiken.se/gtfs/xt/xt.zip

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;

mod config;
mod error;
mod feed;
mod gtfs;
mod resolver;
mod scheduler;

use config::AppConfig;
use gtfs::{GtfsConfig, GtfsStore};
use resolver::{BusNumberResolver, ResolverConfig};
use scheduler::RefreshScheduler;

#[derive(Clone)]
struct AppState {
    store: Arc<GtfsStore>,
    resolver: Arc<BusNumberResolver>,
    feed_api_key: Option<String>,
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
// API Endpoints
// ============================================================================

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "xtlive",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn get_vehicles(state: web::Data<AppState>) -> HttpResponse {
    let Some(api_key) = state.feed_api_key.clone() else {
        return HttpResponse::ServiceUnavailable().json(
            ApiResponse::<Vec<feed::VehiclePayload>>::error("API_KEY is not configured".to_string()),
        );
    };

    let store = state.store.clone();
    let resolver = state.resolver.clone();
    let result = tokio::task::spawn_blocking(move || {
        let tables = store.snapshot();
        feed::fetch_vehicles(&api_key, &resolver, &tables)
    })
    .await;

    match result {
        Ok(Ok(vehicles)) => {
            info!("🚌 Serving {} vehicles", vehicles.len());
            HttpResponse::Ok().json(ApiResponse::success(vehicles))
        }
        Ok(Err(e)) => {
            error!("Failed to fetch vehicle feed: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<Vec<feed::VehiclePayload>>::error(
                format!("Failed to fetch vehicle feed: {}", e),
            ))
        }
        Err(e) => {
            error!("Vehicle feed task panicked: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<Vec<feed::VehiclePayload>>::error(
                "Vehicle feed task failed".to_string(),
            ))
        }
    }
}

async fn gtfs_status(state: web::Data<AppState>) -> HttpResponse {
    let tables = state.store.snapshot();
    let metadata = state.store.metadata();
    let using_synthetic = metadata.is_synthetic;

    let examples: Vec<_> = tables
        .routes
        .iter()
        .take(5)
        .map(|(id, bus_number)| {
            let info = tables.route_info.get(id);
            serde_json::json!({
                "id": id,
                "busNumber": bus_number,
                "color": info.map(|i| format!("#{}", i.color)),
                "textColor": info.map(|i| format!("#{}", i.text_color)),
                "longName": info.map(|i| i.long_name.clone()),
            })
        })
        .collect();

    HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
        "loaded": !tables.routes.is_empty(),
        "stats": {
            "routes": tables.routes.len(),
            "trips": tables.trip_to_route.len(),
            "blocks": tables.block_to_route.len(),
        },
        "examples": { "routes": examples },
        "downloadMetadata": metadata,
        "usingSyntheticData": using_synthetic,
    })))
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    let next_call = state.store.metadata().download_count + 1;
    warn!(
        "🔄 Manual GTFS refresh requested (API call #{} of the monthly quota)",
        next_call
    );

    match scheduler::run_refresh(state.store.clone()).await {
        Ok(()) => {
            info!("✓ Manual GTFS refresh completed");
            HttpResponse::Ok().json(ApiResponse::success("GTFS data refreshed".to_string()))
        }
        Err(e) => {
            error!("Manual GTFS refresh failed: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error(format!("Refresh failed: {}", e)))
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: AppConfig, store: Arc<GtfsStore>) -> std::io::Result<()> {
    let app_state = AppState {
        store: store.clone(),
        resolver: Arc::new(BusNumberResolver::new(ResolverConfig::default())),
        feed_api_key: config.feed_api_key.clone(),
    };

    let refresh_scheduler = RefreshScheduler::new(store);
    refresh_scheduler.start();

    info!("🌐 Server running on http://0.0.0.0:{}", config.port);
    info!("   GET  /health             - Health check");
    info!("   GET  /api/vehicles       - Annotated realtime vehicles");
    info!("   GET  /api/gtfs/status    - Dataset status and metadata");
    info!("   POST /api/admin/refresh  - Force a GTFS refresh");

    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api")
                    .route("/vehicles", web::get().to(get_vehicles))
                    .route("/gtfs/status", web::get().to(gtfs_status))
                    .route("/admin/refresh", web::post().to(force_refresh)),
            )
    })
    .bind(("0.0.0.0", config.port))?
    .run()
    .await;

    refresh_scheduler.stop();
    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("\n🚍 X-trafik Live Tracker v{}\n", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env();
    config.log_key_status();
    info!("Data directory: {:?}", config.data_dir);

    let store = Arc::new(GtfsStore::new(GtfsConfig::new(
        config.data_dir.clone(),
        config.static_api_key.clone(),
    )));

    info!("📥 Loading static GTFS data...");
    match store.load(false) {
        Ok(outcome) => {
            let tables = store.snapshot();
            info!(
                "✓ GTFS data ready: {} routes, {} trips, {} blocks{}",
                tables.routes.len(),
                tables.trip_to_route.len(),
                tables.block_to_route.len(),
                if outcome.is_synthetic { " (synthetic)" } else { "" }
            );
        }
        Err(e) => {
            warn!(
                "⚠️ GTFS data could not be loaded ({}); line number resolution will be limited",
                e
            );
        }
    }

    actix_web::rt::System::new().block_on(run_server(config, store))
}
