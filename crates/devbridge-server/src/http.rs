//! HTTP request handlers
//!
//! The whole surface is GET: WebSocket upgrade, discovery, serial control,
//! GPIO control, and embedded static files, all behind an allow-all CORS
//! layer so the hosted web UI can reach a bridge on another origin.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State, WebSocketUpgrade},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::{debug, warn};

use devbridge_discovery::{clamp_timeout, local_serial_services, parse_type_list};
use devbridge_serial::{is_valid_baud_rate, SerialState, VALID_BAUD_RATES};
use devbridge_web::Assets;

use crate::state::AppState;
use crate::websocket;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket proxy
        .route("/ws", get(ws_handler))
        .route("/connect", get(ws_handler))
        // Discovery
        .route("/mdns", get(mdns_handler))
        // Serial control
        .route("/sc", get(serial_control_handler))
        // GPIO control
        .route("/gpio", get(gpio_set_handler))
        .route("/gl", get(gpio_list_handler))
        // Embedded static files
        .fallback(static_handler)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Allow-all CORS, including the private-network preflight the browser sends
/// before talking to a LAN address from a public origin.
async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response);
        return response;
    }
    let mut response = next.run(req).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert("Access-Control-Allow-Credentials", HeaderValue::from_static("true"));
    headers.insert("Access-Control-Allow-Methods", HeaderValue::from_static("GET,POST,OPTIONS"));
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type,Accept,Origin,X-Requested-With,Authorization"),
    );
    headers.insert("Access-Control-Allow-Private-Network", HeaderValue::from_static("true"));
    headers.insert("Access-Control-Max-Age", HeaderValue::from_static("86400"));
}

/// `GET /ws?host=H&port=P` (alias `/connect`): upgrade and proxy to `H:P`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let host = params.get("host").cloned().unwrap_or_default();
    let port_str = params.get("port").cloned().unwrap_or_default();

    if host.is_empty() || port_str.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing host or port parameter").into_response();
    }
    let port: u16 = match port_str.parse() {
        Ok(port) => port,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid port parameter").into_response(),
    };

    ws.max_message_size(websocket::READ_LIMIT)
        .on_upgrade(move |socket| websocket::proxy_session(socket, host, port))
}

/// `GET /mdns?types=csv&timeout=ms`: browse the requested service types and
/// fold in the local serial snapshot when asked for.
async fn mdns_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let timeout = clamp_timeout(params.get("timeout").and_then(|t| t.parse().ok()));
    let (network, wants_local) =
        parse_type_list(params.get("types").map(String::as_str).unwrap_or(""));

    let host = state.config.advertised_host();
    let mut devices = devbridge_discovery::scan(&network, timeout, &host).await;

    if wants_local {
        // refresh so a just-plugged adapter shows up in the same request
        state.monitor.sync_now().await;
        devices.extend(local_serial_services(&state.registry, &host));
    }

    Json(json!({ "devices": devices }))
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value == "true"
}

/// `GET /sc?path=..|port=..&dtr=..&rts=..&baud=..`: persist modem-line and
/// baud state, apply it to the device best-effort.
async fn serial_control_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let dtr = params.get("dtr").map(|v| parse_flag(v));
    let rts = params.get("rts").map(|v| parse_flag(v));
    let baud_str = params.get("baud");

    let mut path = params.get("path").cloned().unwrap_or_default();
    if path.is_empty() {
        if let Some(Ok(tcp_port)) = params.get("port").map(|p| p.parse::<u16>()) {
            path = state.registry.path_for_tcp_port(tcp_port).unwrap_or_default();
        }
    }
    if path.is_empty() || (dtr.is_none() && rts.is_none() && baud_str.is_none()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing path/tcpPort or dtr/rts/baud param" })),
        )
            .into_response();
    }

    let mut baud = None;
    if let Some(raw) = baud_str {
        match raw.parse::<u32>() {
            Ok(rate) if is_valid_baud_rate(rate) => baud = Some(rate),
            Ok(_) | Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid baud rate", "validRates": VALID_BAUD_RATES })),
                )
                    .into_response();
            }
        }
    }

    let current = state.registry.state(&path);
    let mut updated = current;

    if let Some(rate) = baud {
        updated.baud_rate = rate;
    }
    if let Some(level) = dtr {
        updated.dtr = level;
    }
    if let Some(level) = rts {
        updated.rts = level;
    }

    // A changed rate force-closes the stored handle; the next checkout
    // reopens at the new speed.
    let baud_changed = baud.is_some_and(|rate| rate != current.baud_rate);
    if baud_changed {
        state.registry.reopen(&path, updated.baud_rate).await;
    }
    state.registry.set_state(&path, updated);

    // Hardware is best-effort from here: a missing device keeps the state
    // write and skips the electrical change. When modem lines are supplied
    // their single checkout also reopens at the new speed; otherwise a bare
    // checkout does it so the next client connect does not pay for the open.
    if dtr.is_some() || rts.is_some() {
        apply_modem_lines(&state, path.clone(), updated, dtr, rts).await;
    } else if baud_changed {
        ensure_reopened(&state, path.clone(), updated.baud_rate).await;
    }

    Json(json!({
        "ok": true,
        "path": path,
        "tcpPort": state.registry.tcp_port_for_path(&path).unwrap_or(0),
        "set": updated,
    }))
    .into_response()
}

async fn apply_modem_lines(
    state: &Arc<AppState>,
    path: String,
    updated: SerialState,
    dtr: Option<bool>,
    rts: Option<bool>,
) {
    let registry = state.registry.clone();
    let result = tokio::task::spawn_blocking(move || {
        match registry.checkout(&path, updated.baud_rate) {
            Ok(handle) => {
                handle.set_modem_lines(dtr, rts);
                registry.release(&path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("skipping modem line change: {}", e),
        Err(e) => warn!("modem line task failed: {}", e),
    }
}

/// Eager reopen after a baud change. Failure is logged, not surfaced: the
/// persisted state already carries the new rate, and the real open happens
/// again on the next client connect anyway.
async fn ensure_reopened(state: &Arc<AppState>, path: String, baud: u32) {
    let registry = state.registry.clone();
    let task_path = path.clone();
    let result = tokio::task::spawn_blocking(move || {
        registry.checkout(&task_path, baud).map(|_| registry.release(&task_path))
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to reopen {} at {}: {}", path, baud, e),
        Err(e) => warn!("reopen task for {} failed: {}", path, e),
    }
}

/// `GET /gpio?path=..&set=0|1`: write a sysfs value file.
async fn gpio_set_handler(Query(params): Query<HashMap<String, String>>) -> Response {
    let raw_path = params.get("path").cloned().unwrap_or_default();
    let set_str = params.get("set").cloned().unwrap_or_default();

    if raw_path.is_empty() || set_str.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing path or set parameter" })),
        )
            .into_response();
    }

    let path = clean_sysfs_path(&raw_path);
    let value = match set_str.parse::<i64>() {
        Ok(v @ 0..=1) => v as u8,
        _ => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid set value" })))
                .into_response();
        }
    };

    let result = crate::gpio::write_value(&path, value);
    let ok = result.is_ok();
    let mut body = json!({ "ok": ok, "path": path, "set": value });
    if let Err(e) = result {
        body["error"] = json!(e.to_string());
    }
    Json(body).into_response()
}

/// `GET /gl`: already-exported GPIOs plus LEDs.
async fn gpio_list_handler() -> Json<serde_json::Value> {
    Json(json!({
        "gpio": crate::gpio::list_gpio(),
        "leds": crate::gpio::list_leds(),
    }))
}

/// Trim quoting noise and lexically normalize a caller-supplied sysfs path.
fn clean_sysfs_path(raw: &str) -> String {
    use std::path::{Component, PathBuf};

    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == ' ');
    let mut out = PathBuf::new();
    for component in std::path::Path::new(trimmed).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.to_string_lossy().into_owned()
}

/// Embedded static files; `/` serves index.html, content type by extension.
async fn static_handler(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/').replace('\\', "/");
    let path = if path.is_empty() { "index.html".to_string() } else { path };

    debug!("serving asset: {}", path);

    match Assets::get(&path) {
        Some(content) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream().to_string();
            (StatusCode::OK, [(header::CONTENT_TYPE, mime)], content.data.to_vec())
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "File not found").into_response(),
    }
}
