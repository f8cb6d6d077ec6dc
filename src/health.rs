use crate::error::{AppError, AppResult};
use crate::server::registry::ListRooms;
use crate::state::{AppState, MetricsSnapshot};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let config = &state.config;
    let uptime_seconds = state.get_uptime_seconds();

    // A dead registry means no new joins, so report it rather than fail the probe
    let rooms = state.registry.send(ListRooms).await;
    let (registry_status, open_rooms) = match &rooms {
        Ok(rooms) => ("running", rooms.len()),
        Err(_) => ("unavailable", 0),
    };

    HttpResponse::Ok().json(json!({
        "status": if rooms.is_ok() { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "classroom-session",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "rooms": {
            "registry": registry_status,
            "open": open_rooms,
            "default_room": config.rooms.default_room,
            "max_participants": config.rooms.max_participants
        },
        "voice": {
            "sample_rate": config.voice.sample_rate,
            "channels": config.voice.channels
        },
        "metrics": {
            "active_connections": metrics.active_connections,
            "protocol_error_rate": metrics.protocol_error_rate()
        },
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "connections": {
            "total": metrics.connections_total,
            "active": metrics.active_connections,
            "joins": metrics.joins
        },
        "messages": {
            "received": metrics.messages_received,
            "protocol_errors": metrics.protocol_errors,
            "protocol_error_rate": metrics.protocol_error_rate(),
            "per_second": per_second(metrics.messages_received, uptime_seconds)
        },
        "relay": relay_stats(&metrics, uptime_seconds),
        "memory": get_memory_info()
    }))
}

/// `GET /api/v1/rooms`
pub async fn list_rooms(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let rooms = state.registry.send(ListRooms).await?;
    Ok(HttpResponse::Ok().json(json!({
        "count": rooms.len(),
        "rooms": rooms
    })))
}

/// `GET /api/v1/rooms/{room}`
pub async fn get_room(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let room_id = path.into_inner();
    let rooms = state.registry.send(ListRooms).await?;

    rooms
        .into_iter()
        .find(|summary| summary.room == room_id)
        .map(|summary| HttpResponse::Ok().json(summary))
        .ok_or_else(|| AppError::NotFound(format!("Room '{}' is not open", room_id)))
}

fn relay_stats(metrics: &MetricsSnapshot, uptime_seconds: u64) -> serde_json::Value {
    let offered = metrics.voice_frames_relayed + metrics.voice_frames_dropped;
    json!({
        "voice_frames_relayed": metrics.voice_frames_relayed,
        "voice_frames_dropped": metrics.voice_frames_dropped,
        "voice_drop_rate": if offered > 0 {
            metrics.voice_frames_dropped as f64 / offered as f64
        } else {
            0.0
        },
        "voice_frames_per_second": per_second(metrics.voice_frames_relayed, uptime_seconds),
        "chat_messages": metrics.chat_messages,
        "whiteboard_updates": metrics.whiteboard_updates
    })
}

fn per_second(count: u64, uptime_seconds: u64) -> f64 {
    if uptime_seconds > 0 {
        count as f64 / uptime_seconds as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "pid": pid,
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::test::{call_and_read_body_json, call_service, init_service, TestRequest};
    use actix_web::{http::StatusCode, App};

    #[actix_web::test]
    async fn test_health_reports_registry() {
        let state = AppState::new(AppConfig::default());
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["rooms"]["registry"], "running");
        assert_eq!(body["rooms"]["open"], 0);
        assert_eq!(body["voice"]["sample_rate"], 44_100);
    }

    #[actix_web::test]
    async fn test_unknown_room_is_not_found() {
        let state = AppState::new(AppConfig::default());
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/rooms/{room}", web::get().to(get_room)),
        )
        .await;

        let req = TestRequest::get()
            .uri("/api/v1/rooms/nowhere")
            .to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_relay_stats_drop_rate() {
        let metrics = MetricsSnapshot {
            connections_total: 0,
            active_connections: 0,
            joins: 0,
            messages_received: 0,
            protocol_errors: 0,
            voice_frames_relayed: 3,
            voice_frames_dropped: 1,
            chat_messages: 0,
            whiteboard_updates: 0,
        };
        let stats = relay_stats(&metrics, 0);
        assert_eq!(stats["voice_drop_rate"], 0.25);
        assert_eq!(stats["voice_frames_per_second"], 0.0);
    }
}
