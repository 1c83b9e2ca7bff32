//! Per-session device registry.
//!
//! Owns all mutable protocol state for one emulator run:
//! - the handshake latch (`initialized`)
//! - the seeded sensor reading catalog
//! - per-sensor configuration overrides
//! - the sensor-to-pin connection map
//!
//! Operations are plain in-memory accessors; none blocks or fails. Callers
//! enforce protocol preconditions (handshake gating, pin conflict checks)
//! before mutating. Exactly one thread touches the registry, so there is no
//! interior locking; that single-writer constraint must hold if the emulator
//! ever accepts more than one peer.

use crate::protocol::Value;
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::debug;

/// One sensor's fields, in catalog order.
pub type Reading = IndexMap<String, Value>;

/// Configuration overrides stored for one sensor, in request order.
pub type SensorConfig = IndexMap<String, String>;

pub struct Registry {
    initialized: bool,
    readings: IndexMap<String, Reading>,
    configs: HashMap<String, SensorConfig>,
    connections: HashMap<String, i64>,
}

impl Registry {
    /// Create a registry over the given reading catalog.
    pub fn new(catalog: IndexMap<String, Reading>) -> Self {
        Self {
            initialized: false,
            readings: catalog,
            configs: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    /// Create a registry seeded with the built-in sensor set.
    pub fn with_default_catalog() -> Self {
        Self::new(default_catalog())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Latch the handshake. Never reverts for the lifetime of the session.
    pub fn set_initialized(&mut self) {
        self.initialized = true;
    }

    /// Snapshot of a sensor's catalog fields. A copy: callers may perturb it
    /// freely without the change ever becoming committed state.
    pub fn reading_for(&self, sensor_id: &str) -> Option<Reading> {
        self.readings.get(sensor_id).cloned()
    }

    pub fn has_sensor(&self, sensor_id: &str) -> bool {
        self.readings.contains_key(sensor_id)
    }

    /// Catalog sensor ids in seed order.
    pub fn sensor_ids(&self) -> Vec<&str> {
        self.readings.keys().map(String::as_str).collect()
    }

    /// Store a sensor's configuration, replacing any previous one.
    pub fn set_config(&mut self, sensor_id: &str, fields: SensorConfig) {
        debug!(sensor_id, fields = fields.len(), "config stored");
        self.configs.insert(sensor_id.to_string(), fields);
    }

    pub fn config_for(&self, sensor_id: &str) -> Option<&SensorConfig> {
        self.configs.get(sensor_id)
    }

    pub fn clear_config(&mut self, sensor_id: &str) {
        self.configs.remove(sensor_id);
    }

    pub fn clear_all_configs(&mut self) {
        self.configs.clear();
    }

    /// Which sensor currently owns a pin, if any.
    pub fn pin_owner(&self, pin: i64) -> Option<&str> {
        self.connections
            .iter()
            .find(|(_, &owned)| owned == pin)
            .map(|(sensor_id, _)| sensor_id.as_str())
    }

    /// Record a sensor-to-pin connection. The caller must already have
    /// checked that no other sensor owns the pin.
    pub fn connect(&mut self, sensor_id: &str, pin: i64) {
        debug!(sensor_id, pin, "pin connected");
        self.connections.insert(sensor_id.to_string(), pin);
    }

    pub fn connection_for(&self, sensor_id: &str) -> Option<i64> {
        self.connections.get(sensor_id).copied()
    }

    /// Remove a sensor's connection, returning the released pin.
    pub fn disconnect(&mut self, sensor_id: &str) -> Option<i64> {
        let released = self.connections.remove(sensor_id);
        if let Some(pin) = released {
            debug!(sensor_id, pin, "pin released");
        }
        released
    }

    pub fn clear_all_connections(&mut self) {
        self.connections.clear();
    }
}

/// Built-in sensor catalog: a spread of common hobbyist sensors plus a
/// six-axis IMU, with plausible baseline values.
pub fn default_catalog() -> IndexMap<String, Reading> {
    IndexMap::from([
        (
            "sensor_001".to_string(),
            Reading::from([
                ("Temperature".to_string(), Value::Float(25.5)),
                ("Humidity".to_string(), Value::Float(60.2)),
                ("type".to_string(), Value::Text("DHT22".to_string())),
            ]),
        ),
        (
            "sensor_002".to_string(),
            Reading::from([
                ("Distance".to_string(), Value::Int(150)),
                ("type".to_string(), Value::Text("Ultrasonic".to_string())),
            ]),
        ),
        (
            "sensor_003".to_string(),
            Reading::from([
                ("Pressure".to_string(), Value::Float(1013.25)),
                ("Temperature".to_string(), Value::Float(22.1)),
                ("type".to_string(), Value::Text("BMP280".to_string())),
            ]),
        ),
        (
            "sensor_004".to_string(),
            Reading::from([
                ("X".to_string(), Value::Int(45)),
                ("Y".to_string(), Value::Int(78)),
                ("Button".to_string(), Value::Int(0)),
                ("type".to_string(), Value::Text("Joystick".to_string())),
            ]),
        ),
        (
            "sensor_005".to_string(),
            Reading::from([
                ("Lux".to_string(), Value::Int(350)),
                ("type".to_string(), Value::Text("Light".to_string())),
            ]),
        ),
        (
            "sensor_006".to_string(),
            Reading::from([
                ("MagField".to_string(), Value::Float(12.5)),
                ("Detected".to_string(), Value::Int(0)),
                ("type".to_string(), Value::Text("Magnetic".to_string())),
            ]),
        ),
        (
            "imu_001".to_string(),
            Reading::from([
                ("acm_x".to_string(), Value::Float(-2.1)),
                ("acm_y".to_string(), Value::Float(0.8)),
                ("acm_z".to_string(), Value::Float(9.8)),
                ("gyr_x".to_string(), Value::Float(0.05)),
                ("gyr_y".to_string(), Value::Float(-0.02)),
                ("gyr_z".to_string(), Value::Float(0.01)),
                ("type".to_string(), Value::Text("IMU".to_string())),
            ]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialized_latch() {
        let mut registry = Registry::with_default_catalog();
        assert!(!registry.is_initialized());

        registry.set_initialized();
        assert!(registry.is_initialized());

        // Latch survives resets of everything else.
        registry.clear_all_configs();
        registry.clear_all_connections();
        assert!(registry.is_initialized());
    }

    #[test]
    fn test_reading_snapshot_is_a_copy() {
        let registry = Registry::with_default_catalog();

        let mut snapshot = registry.reading_for("sensor_001").unwrap();
        snapshot.insert("Temperature".to_string(), Value::Float(99.9));

        let fresh = registry.reading_for("sensor_001").unwrap();
        assert_eq!(fresh.get("Temperature").unwrap(), &Value::Float(25.5));
    }

    #[test]
    fn test_reading_for_unknown_sensor() {
        let registry = Registry::with_default_catalog();
        assert!(registry.reading_for("sensor_999").is_none());
        assert!(!registry.has_sensor("sensor_999"));
    }

    #[test]
    fn test_catalog_order_is_stable() {
        let registry = Registry::with_default_catalog();
        let ids = registry.sensor_ids();
        assert_eq!(ids.first(), Some(&"sensor_001"));
        assert_eq!(ids.last(), Some(&"imu_001"));
        assert_eq!(ids.len(), 7);
    }

    #[test]
    fn test_config_replace_and_clear() {
        let mut registry = Registry::with_default_catalog();

        registry.set_config(
            "sensor_001",
            SensorConfig::from([("interval".to_string(), "500".to_string())]),
        );
        registry.set_config(
            "sensor_001",
            SensorConfig::from([("unit".to_string(), "F".to_string())]),
        );

        let config = registry.config_for("sensor_001").unwrap();
        assert!(config.get("interval").is_none());
        assert_eq!(config.get("unit").unwrap(), "F");

        registry.clear_config("sensor_001");
        assert!(registry.config_for("sensor_001").is_none());
    }

    #[test]
    fn test_pin_bookkeeping() {
        let mut registry = Registry::with_default_catalog();

        registry.connect("sensor_001", 4);
        registry.connect("sensor_002", 7);

        assert_eq!(registry.pin_owner(4), Some("sensor_001"));
        assert_eq!(registry.pin_owner(7), Some("sensor_002"));
        assert_eq!(registry.pin_owner(9), None);
        assert_eq!(registry.connection_for("sensor_001"), Some(4));

        assert_eq!(registry.disconnect("sensor_001"), Some(4));
        assert_eq!(registry.disconnect("sensor_001"), None);
        assert_eq!(registry.pin_owner(4), None);
    }

    #[test]
    fn test_clear_all_connections() {
        let mut registry = Registry::with_default_catalog();
        registry.connect("sensor_001", 4);
        registry.connect("sensor_002", 7);

        registry.clear_all_connections();
        assert_eq!(registry.pin_owner(4), None);
        assert_eq!(registry.connection_for("sensor_002"), None);
    }
}
