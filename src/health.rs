use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "device_path": config.server.device_path
        },
        "upstream": {
            "host": config.upstream_host(),
            "handshake_mode": config.upstream.handshake_mode
        },
        "audio": {
            "device_sample_rate": config.audio.device_sample_rate,
            "upstream_sample_rate": config.audio.upstream_sample_rate,
            "resample_return_path": config.audio.resample_return_path,
            "output_framing": config.audio.output_framing
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    vm_rss = parse_kb(line);
                } else if line.starts_with("VmSize:") {
                    vm_size = parse_kb(line);
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
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

/// `VmRSS:     1234 kB` → bytes
fn parse_kb(line: &str) -> u64 {
    line.split_whitespace()
        .nth(1)
        .and_then(|kb| kb.parse::<u64>().ok())
        .unwrap_or(0)
        * 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{body::to_bytes, test as actix_test, App};

    #[test]
    fn test_parse_kb() {
        assert_eq!(parse_kb("VmRSS:\t    2048 kB"), 2048 * 1024);
        assert_eq!(parse_kb("VmRSS:"), 0);
    }

    #[actix_web::test]
    async fn test_health_reports_audio_rates() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());

        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["audio"]["device_sample_rate"], 16000);
        assert_eq!(value["audio"]["upstream_sample_rate"], 24000);
        assert_eq!(value["upstream"]["host"], "api.openai.com");
    }
}
