//! HTTP interface of the meter.
//!
//! Serves a small status page and a JSON API. Reading a channel through
//! either of them takes a snapshot, so the pulse and energy figures are
//! "since the previous read".

use crate::config::{ChannelUpdate, ConfigStore, UpdateOutcome};
use crate::error::ConfigError;
use crate::estimator::{ChannelEstimator, PULSES_PER_KWH_RANGE_MAX, PULSES_PER_KWH_RANGE_MIN};
use crate::pulse_input::{PIN_RANGE_MAX, PIN_RANGE_MIN};
use crate::registry::{ChannelRegistry, MAX_CHANNELS};
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::Html;
use axum::routing::get;
use axum::{Form, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result code carried in the `status` field of every JSON reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusId {
    Ok = 0,
    Pending = 1,
    Input = 2,
    Parameter = 3,
    Internal = 4,
    Invalid = 5,
}

impl StatusId {
    pub fn code(self) -> u8 {
        self as u8
    }
}

const PAGE_HEAD: &str = "<!DOCTYPE html>\r\n<html>\r\n<head>\r\n\
<meta charset=\"utf-8\">\r\n<title>S0 Smartmeter</title>\r\n</head>\r\n<body>\r\n\
<h1>S0 Smartmeter</h1>\r\n";
const PAGE_TAIL: &str = "</body>\r\n</html>\r\n";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<ChannelRegistry>,
    store: Arc<ConfigStore>,
}

impl AppState {
    pub fn new(registry: Arc<ChannelRegistry>, store: Arc<ConfigStore>) -> Self {
        Self { registry, store }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/s0-interface/:id", get(s0_interface))
        .route("/api/s0-interfaces", get(s0_interfaces))
        .route("/api/configure/:id", get(configure_get).post(configure_post))
        .fallback(not_found)
        .with_state(state)
}

fn parse_channel_id(raw: &str) -> Option<u8> {
    raw.trim()
        .parse::<u8>()
        .ok()
        .filter(|id| usize::from(*id) < MAX_CHANNELS)
}

fn reply(data: Value, status: StatusId) -> Json<Value> {
    Json(json!({
        "data": data,
        "status": status.code(),
    }))
}

fn channel_json(channel: &ChannelEstimator) -> Value {
    let snapshot = channel.snapshot();
    json!({
        "id": channel.id(),
        "name": channel.name(),
        "powerConsumption": snapshot.power_watts,
        "pulses": snapshot.pulse_count,
        "energyConsumption": snapshot.energy_ws,
    })
}

async fn root(State(state): State<AppState>) -> Html<String> {
    let mut page = String::from(PAGE_HEAD);

    for channel in state.registry.iter() {
        if !channel.is_enabled() {
            page.push_str(&format!(
                "<h2>Interface {}</h2>\r\n<p>Disabled</p>\r\n",
                channel.id()
            ));
            continue;
        }

        let snapshot = channel.snapshot();
        page.push_str(&format!(
            "<h2>Interface {} - {}</h2>\r\n<ul>\r\n\
             <li>Power Consumption: {} W</li>\r\n\
             <li>Pulses counted: {}</li>\r\n\
             <li>Energy Consumption: {} Ws</li>\r\n</ul>\r\n",
            channel.id(),
            escape_html(channel.name()),
            snapshot.power_watts,
            snapshot.pulse_count,
            snapshot.energy_ws,
        ));
    }

    page.push_str(PAGE_TAIL);
    Html(page)
}

async fn s0_interface(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let Some(channel) = parse_channel_id(&id).and_then(|id| state.registry.channel(id)) else {
        return reply(json!({}), StatusId::Parameter);
    };

    if channel.is_enabled() {
        reply(channel_json(channel), StatusId::Ok)
    } else {
        reply(json!({}), StatusId::Ok)
    }
}

async fn s0_interfaces(State(state): State<AppState>) -> Json<Value> {
    let channels: Vec<Value> = state.registry.enabled().map(channel_json).collect();
    reply(Value::Array(channels), StatusId::Ok)
}

async fn configure_get(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let Some(settings) = parse_channel_id(&id).and_then(|id| state.store.channel(id)) else {
        return reply(json!({}), StatusId::Parameter);
    };

    reply(
        json!({
            "isEnabled": settings.enabled,
            "name": settings.name,
            "pinS0": settings.pin,
            "pinS0Range": [PIN_RANGE_MIN, PIN_RANGE_MAX],
            "pulsesPerKWH": settings.pulses_per_kwh,
            "pulsesPerKWHRange": [PULSES_PER_KWH_RANGE_MIN, PULSES_PER_KWH_RANGE_MAX],
        }),
        StatusId::Ok,
    )
}

async fn configure_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Form(update): Form<ChannelUpdate>,
) -> Json<Value> {
    let Some(id) = parse_channel_id(&id) else {
        return reply(json!({ "message": "Invalid interface!" }), StatusId::Parameter);
    };

    let (message, status) = match state.store.update_channel(id, &update) {
        Ok(UpdateOutcome::Saved) => ("Parameter updated. Please reboot.", StatusId::Ok),
        Ok(UpdateOutcome::Unchanged) => {
            info!("Parameter of interface {} not updated", id);
            ("Parameter not updated.", StatusId::Ok)
        }
        Err(e @ ConfigError::PinConflict { .. }) => {
            warn!("Parameter of interface {} not updated: {}", id, e);
            ("Parameter not updated, because they are invalid.", StatusId::Invalid)
        }
        Err(e) => {
            error!("Failed to store parameter of interface {}: {}", id, e);
            ("Parameter not updated.", StatusId::Internal)
        }
    };

    reply(json!({ "message": message }), status)
}

async fn not_found(uri: Uri) -> (StatusCode, &'static str) {
    error!("Requested page not found: {}", uri);
    (StatusCode::NOT_FOUND, "Not Found")
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
