use crate::{models::DiagnosticsResponse, AppState};
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Report registry and host statistics
pub async fn diagnostics(State(app_state): State<AppState>) -> (StatusCode, Json<DiagnosticsResponse>) {
    let n_conn = app_state.registry.len().await as u32;
    let stats = app_state.registry.stats();
    let uptime_secs = (Utc::now() - app_state.started_at).num_seconds();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Evicted: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_conn,
        stats.evicted_total
    );

    (
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn,
            n_registered_total: stats.registered_total,
            n_evicted_total: stats.evicted_total,
            uptime_secs,
            started_at: app_state.started_at.to_rfc3339(),
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    )
}
