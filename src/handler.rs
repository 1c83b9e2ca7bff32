//! Protocol method handlers and dispatch.
//!
//! Routes a decoded request to one of the six protocol methods:
//! - INIT: handshake and version compatibility gate
//! - UPDATE: report a sensor reading
//! - CONFIG: store per-sensor configuration
//! - RESET: clear configuration and connections
//! - CONNECT / DISCONNECT: pin bookkeeping
//!
//! Every method except INIT is gated behind the handshake latch. Responses
//! always lead with `status` (`1` success, `0` failure), then the echoed
//! `id` for id-scoped methods, then method fields; failures carry `error`.

use crate::protocol::{Request, Response, Value};
use crate::registry::{Registry, SensorConfig};
use crate::synth::ReadingSource;
use tracing::{debug, info, warn};

/// Expected handshake versions, fixed at startup.
#[derive(Debug, Clone)]
pub struct Versions {
    pub api: String,
    pub db: String,
}

/// The closed set of protocol methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Init,
    Update,
    Config,
    Reset,
    Connect,
    Disconnect,
}

impl Method {
    /// Case-insensitive method lookup.
    pub fn parse(name: &str) -> Option<Method> {
        match name.to_ascii_uppercase().as_str() {
            "INIT" => Some(Method::Init),
            "UPDATE" => Some(Method::Update),
            "CONFIG" => Some(Method::Config),
            "RESET" => Some(Method::Reset),
            "CONNECT" => Some(Method::Connect),
            "DISCONNECT" => Some(Method::Disconnect),
            _ => None,
        }
    }
}

/// Route a request to its handler.
///
/// A pure function of (registry state, request); exactly one method's side
/// effects run per call. Unknown or absent `type` produces the
/// unknown-method failure without touching the registry.
pub fn dispatch(
    request: &Request,
    registry: &mut Registry,
    source: &mut dyn ReadingSource,
    versions: &Versions,
) -> Response {
    let name = field(request, "type").unwrap_or("");
    let Some(method) = Method::parse(name) else {
        debug!(name, "unknown request type");
        return failure(format!(
            "Unknown request type: {}",
            name.to_ascii_uppercase()
        ));
    };

    if method != Method::Init && !registry.is_initialized() {
        debug!(?method, "request before handshake");
        return failure("Protocol not initialized");
    }

    match method {
        Method::Init => handle_init(request, registry, versions),
        Method::Update => handle_update(request, registry, source),
        Method::Config => handle_config(request, registry),
        Method::Reset => handle_reset(request, registry),
        Method::Connect => handle_connect(request, registry),
        Method::Disconnect => handle_disconnect(request, registry),
    }
}

/// INIT: latch the session once both version fields match exactly.
fn handle_init(request: &Request, registry: &mut Registry, versions: &Versions) -> Response {
    let app = field(request, "app").unwrap_or("Unknown");
    let api = field(request, "api").unwrap_or("0.0.0");
    let db = field(request, "db").unwrap_or("0.0.0");

    if api != versions.api || db != versions.db {
        warn!(api, db, "handshake rejected");
        return failure(format!(
            "Version mismatch - API:{api} (need {}), DB:{db} (need {})",
            versions.api, versions.db
        ));
    }

    registry.set_initialized();
    info!(app, "handshake complete");
    let mut response = success();
    response.insert(
        "message".to_string(),
        Value::Text(format!("Initialized with {app}")),
    );
    response
}

/// UPDATE: report one sensor's reading, perturbed through the source.
/// Read-only on the registry; the catalog baseline is never mutated.
fn handle_update(
    request: &Request,
    registry: &mut Registry,
    source: &mut dyn ReadingSource,
) -> Response {
    let id = field(request, "id").unwrap_or("");
    let Some(reading) = registry.reading_for(id) else {
        debug!(id, "update for unknown sensor");
        return failure_for(id, format!("Sensor {id} not found"));
    };

    debug!(id, "reporting reading");
    let mut response = success_for(id);
    response.extend(source.perturb(reading));
    response
}

/// CONFIG: store every request field except `type` and `id` as the sensor's
/// configuration, replacing whatever was there.
fn handle_config(request: &Request, registry: &mut Registry) -> Response {
    let id = field(request, "id").unwrap_or("");
    if id.is_empty() {
        return failure_for(id, "Invalid sensor ID");
    }
    if !registry.has_sensor(id) {
        return failure_for(id, format!("Sensor {id} not found"));
    }

    let fields: SensorConfig = request
        .iter()
        .filter(|(key, _)| key.as_str() != "type" && key.as_str() != "id")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let names: Vec<&str> = fields.keys().map(String::as_str).collect();
    let message = format!("Configuration applied: {}", names.join(", "));
    registry.set_config(id, fields);

    let mut response = success_for(id);
    response.insert("message".to_string(), Value::Text(message));
    response
}

/// RESET: `id=all` clears every config and connection; a known id clears
/// that sensor's config and connection together.
fn handle_reset(request: &Request, registry: &mut Registry) -> Response {
    let id = field(request, "id").unwrap_or("");

    if id == "all" {
        registry.clear_all_configs();
        registry.clear_all_connections();
        info!("all sensors reset");
        return success_for(id);
    }

    if !registry.has_sensor(id) {
        return failure_for(id, format!("Sensor {id} not found"));
    }

    registry.clear_config(id);
    let _ = registry.disconnect(id);
    debug!(id, "sensor reset");
    success_for(id)
}

/// CONNECT: bind a sensor to a pin. Pins are exclusively owned; the same
/// sensor re-requesting its own pin succeeds.
fn handle_connect(request: &Request, registry: &mut Registry) -> Response {
    let id = field(request, "id").unwrap_or("");
    let pin_raw = field(request, "pin").unwrap_or("");
    if id.is_empty() || pin_raw.is_empty() {
        return failure("Missing sensor ID or pin number");
    }

    let Ok(pin) = pin_raw.parse::<i64>() else {
        return failure_for(id, format!("Invalid pin number: {pin_raw}"));
    };

    if !registry.has_sensor(id) {
        return failure_for(id, format!("Sensor {id} not found"));
    }

    if let Some(owner) = registry.pin_owner(pin) {
        if owner != id {
            debug!(id, pin, owner, "pin conflict");
            return failure_for(id, format!("Pin {pin} already used by sensor {owner}"));
        }
    }

    registry.connect(id, pin);
    let mut response = success_for(id);
    response.insert("pin".to_string(), Value::Int(pin));
    response
}

/// DISCONNECT: release a sensor's pin and echo which pin was freed.
fn handle_disconnect(request: &Request, registry: &mut Registry) -> Response {
    let id = field(request, "id").unwrap_or("");
    match registry.disconnect(id) {
        Some(pin) => {
            let mut response = success_for(id);
            response.insert("pin".to_string(), Value::Int(pin));
            response
        }
        None => failure_for(id, format!("Sensor {id} not connected")),
    }
}

fn field<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.get(name).map(String::as_str)
}

fn success() -> Response {
    Response::from([("status".to_string(), Value::Text("1".to_string()))])
}

fn success_for(id: &str) -> Response {
    let mut response = success();
    response.insert("id".to_string(), Value::Text(id.to_string()));
    response
}

fn failure(error: impl Into<String>) -> Response {
    Response::from([
        ("status".to_string(), Value::Text("0".to_string())),
        ("error".to_string(), Value::Text(error.into())),
    ])
}

fn failure_for(id: &str, error: impl Into<String>) -> Response {
    Response::from([
        ("status".to_string(), Value::Text("0".to_string())),
        ("id".to_string(), Value::Text(id.to_string())),
        ("error".to_string(), Value::Text(error.into())),
    ])
}
