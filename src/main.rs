mod api;
mod backup;
mod config;
mod error;
mod files;
mod lifecycle;
mod logs;
mod notify;
mod path_guard;
mod process;
mod state;
mod store;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = config::config_path();
    let mut cfg = config::load_config(&config_path).await?;
    config::retain_valid_rooms(&mut cfg);
    let bind_address = cfg.agent.bind_address.clone();
    let static_dir = cfg.agent.static_directory.clone();
    let upload_limit = cfg.agent.upload_limit_mb.saturating_mul(1024 * 1024);

    // Kill any orphaned servers from a previous crash
    process::kill_orphaned_servers(&cfg.rooms).await;

    let state = state::AppState::new(cfg.clone(), config_path);

    // Autostart rooms
    for room in &cfg.rooms {
        if room.autostart {
            let supervisor = state.supervisor.clone();
            let id = room.id.clone();
            tokio::spawn(async move {
                if let Err(e) = supervisor.start(&id).await {
                    tracing::error!(room = %id, "Autostart failed: {}", e);
                }
            });
        }
    }

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/api/rooms", get(api::list_rooms).post(api::create_room))
        .route(
            "/api/rooms/{id}",
            get(api::get_room)
                .put(api::update_room)
                .delete(api::delete_room),
        )
        .route("/api/rooms/{id}/start", post(api::start_room_handler))
        .route("/api/rooms/{id}/stop", post(api::stop_room_handler))
        .route("/api/rooms/{id}/restart", post(api::restart_room_handler))
        .route("/api/rooms/{id}/status", get(api::room_status))
        .route(
            "/api/rooms/{id}/logs",
            get(api::room_logs).delete(api::clear_room_logs),
        )
        .route("/api/rooms/{id}/files", delete(api::delete_file))
        .route("/api/rooms/{id}/files/browse", get(api::browse_files))
        .route("/api/rooms/{id}/files/read", get(api::read_file))
        .route("/api/rooms/{id}/files/save", post(api::save_file))
        .route("/api/rooms/{id}/files/upload", post(api::upload_file))
        .route("/api/rooms/{id}/backup", post(api::create_backup))
        .route("/api/rooms/{id}/backups", get(api::list_backups))
        .route(
            "/api/rooms/{id}/backups/{name}/restore",
            post(api::restore_backup),
        )
        .route("/api/audit", get(api::audit_log))
        .route("/api/events/ws", get(api::events_ws))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone())
        .fallback_service(ServeDir::new(static_dir));

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down rooms...");
    state.supervisor.shutdown_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
