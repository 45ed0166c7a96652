//! End-to-end scenarios: configuration in, published states out

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cm_core::Context;
use cm_engine::{
    attributes, ComplianceManager, ComplianceSensor, ManagerConfig, PersistedSensorState,
    SensorConfig, TargetResolver,
};
use cm_event_bus::EventBus;
use cm_registries::{DeviceEntry, DeviceRegistry, EntityEntry, EntityRegistry};
use cm_state_store::StateStore;
use cm_template::TemplateEngine;
use serde_json::json;

struct Fixture {
    store: Arc<StateStore>,
    entities: Arc<EntityRegistry>,
    devices: Arc<DeviceRegistry>,
    templates: Arc<TemplateEngine>,
}

impl Fixture {
    fn new() -> Self {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::new(bus));
        let templates = Arc::new(TemplateEngine::new(store.clone()));
        Self {
            store,
            entities: Arc::new(EntityRegistry::new()),
            devices: Arc::new(DeviceRegistry::new()),
            templates,
        }
    }

    fn resolver(&self) -> TargetResolver {
        TargetResolver::new(self.entities.clone(), self.devices.clone())
    }

    fn sensor(&self, yaml: &str) -> ComplianceSensor {
        let config: SensorConfig = serde_yaml::from_str(yaml).unwrap();
        ComplianceSensor::new(config, self.store.clone(), self.templates.clone(), &self.resolver())
            .unwrap()
    }

    fn set(&self, entity_id: &str, state: &str) {
        self.store.set(
            entity_id.parse().unwrap(),
            state,
            HashMap::new(),
            Context::new(),
        );
    }

    fn set_with_attrs(&self, entity_id: &str, state: &str, attrs: HashMap<String, serde_json::Value>) {
        self.store
            .set(entity_id.parse().unwrap(), state, attrs, Context::new());
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn door_left_open_rides_out_its_grace_period() {
    let fixture = Fixture::new();
    let mut sensor = fixture.sensor(
        r#"
        name: Front Door
        rules:
          - target:
              entity_id: binary_sensor.front_door
            condition:
              expected_state: closed
            grace_period: "0:05:00"
            severity: warning
        "#,
    );

    let t0 = Utc::now();
    fixture.set("binary_sensor.front_door", "open");

    sensor.evaluate_at(t0);
    assert!(!sensor.is_on(), "violation pending during grace");

    sensor.evaluate_at(t0 + chrono::Duration::minutes(4));
    assert!(!sensor.is_on());

    sensor.evaluate_at(t0 + chrono::Duration::minutes(6));
    assert!(sensor.is_on());

    let published = fixture.store.get("binary_sensor.compliance_front_door").unwrap();
    assert_eq!(published.state, "on");
    assert_eq!(published.attribute(attributes::SEVERITY), Some(&json!(2)));
    assert_eq!(
        published.attribute(attributes::ACTIVE_VIOLATIONS),
        Some(&json!(["binary_sensor.front_door"]))
    );

    // Closing the door clears everything on the next pass
    fixture.set("binary_sensor.front_door", "closed");
    sensor.evaluate_at(t0 + chrono::Duration::minutes(7));
    assert!(!sensor.is_on());
    assert!(sensor.persisted_state().violations_registry.is_empty());
}

#[tokio::test]
async fn snooze_hides_violation_but_grace_keeps_running() {
    let fixture = Fixture::new();
    let mut sensor = fixture.sensor(
        r#"
        name: Fridge
        rules:
          - target:
              entity_id: sensor.fridge_temp
            condition:
              expected_numeric:
                max: 8
            grace_period: "0:10:00"
        "#,
    );

    let t0 = Utc::now();
    fixture.set("sensor.fridge_temp", "12.5");
    sensor.evaluate_at(t0);

    // Snoozed halfway through the grace window
    sensor.snooze_at(
        &["sensor.fridge_temp".to_string()],
        Duration::from_secs(5 * 60),
        t0 + chrono::Duration::minutes(5),
    );
    assert!(!sensor.is_on());

    // Snooze ends at t0+10m, exactly when grace runs out: the violation
    // surfaces immediately instead of starting a fresh window
    sensor.evaluate_at(t0 + chrono::Duration::minutes(11));
    assert!(sensor.is_on());
}

#[tokio::test]
async fn area_target_tracks_devices_and_direct_entities() {
    let fixture = Fixture::new();
    fixture
        .devices
        .register(DeviceEntry::new("hvac_unit").with_area("bedroom"));
    fixture.entities.register(
        EntityEntry::new("sensor.hvac_filter").with_device("hvac_unit"),
    );
    fixture
        .entities
        .register(EntityEntry::new("binary_sensor.bedroom_window").with_area("bedroom"));

    let sensor = fixture.sensor(
        r#"
        name: Bedroom
        rules:
          - target:
              area_id: bedroom
            condition:
              expected_state: "ok"
        "#,
    );

    let tracked = sensor.tracked_entities();
    assert!(tracked.contains("sensor.hvac_filter"));
    assert!(tracked.contains("binary_sensor.bedroom_window"));
    assert_eq!(tracked.len(), 2);
}

#[tokio::test]
async fn template_rule_reads_other_entities() {
    let fixture = Fixture::new();
    fixture.set("input_boolean.vacation_mode", "off");
    let mut sensor = fixture.sensor(
        r#"
        name: Thermostat
        rules:
          - target:
              entity_id: climate.living_room
            condition:
              attribute: temperature
              value_template: >-
                {{ t_state | float <= 22 or is_state('input_boolean.vacation_mode', 'on') }}
        "#,
    );

    let t0 = Utc::now();
    fixture.set_with_attrs(
        "climate.living_room",
        "heat",
        HashMap::from([("temperature".to_string(), json!(25))]),
    );
    sensor.evaluate_at(t0);
    assert!(sensor.is_on(), "25 degrees with vacation mode off");

    fixture.set("input_boolean.vacation_mode", "on");
    sensor.evaluate_at(t0);
    assert!(!sensor.is_on(), "vacation mode excuses the setpoint");
}

#[tokio::test]
async fn restart_restores_grace_and_snooze_clocks() {
    let fixture = Fixture::new();
    let sensor_yaml = r#"
        name: Garage
        rules:
          - target:
              entity_id: cover.garage_door
            condition:
              expected_state: closed
            grace_period: "0:30:00"
    "#;

    let t0 = Utc::now();
    let mut before = fixture.sensor(sensor_yaml);
    fixture.set("cover.garage_door", "open");
    before.evaluate_at(t0);
    before.snooze_at(
        &["cover.other".to_string()],
        Duration::from_secs(3600),
        t0,
    );

    let raw = serde_json::to_string(&before.persisted_state()).unwrap();
    before.shutdown();
    drop(before);

    // "Restart": fresh sensor, same persisted snapshot
    let snapshot: PersistedSensorState = serde_json::from_str(&raw).unwrap();
    let mut after = fixture.sensor(sensor_yaml);
    after.restore(&snapshot);

    // Original grace clock still applies: not a fresh 30 minutes
    after.evaluate_at(t0 + chrono::Duration::minutes(29));
    assert!(!after.is_on());
    after.evaluate_at(t0 + chrono::Duration::minutes(31));
    assert!(after.is_on());

    let restored = after.persisted_state();
    assert_eq!(
        restored.snooze_registry.get("cover.other"),
        snapshot.snooze_registry.get("cover.other")
    );
}

#[tokio::test]
async fn manager_rolls_up_worst_severity_across_sensors() {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(StateStore::new(bus.clone()));
    let config = ManagerConfig::from_yaml(
        r#"
sensors:
  - name: Doors
    rules:
      - target:
          entity_id: binary_sensor.front_door
        condition:
          expected_state: "off"
        severity: warning
  - name: Smoke
    rules:
      - target:
          entity_id: binary_sensor.smoke
        condition:
          expected_state: "off"
        severity: critical
global:
  name: Home
  sources:
    - binary_sensor.compliance_doors
    - binary_sensor.compliance_smoke
"#,
    )
    .unwrap();

    let mut manager = ComplianceManager::new(
        config,
        store.clone(),
        bus,
        Arc::new(EntityRegistry::new()),
        Arc::new(DeviceRegistry::new()),
    )
    .unwrap();

    store.set(
        "binary_sensor.front_door".parse().unwrap(),
        "on",
        HashMap::new(),
        Context::new(),
    );
    store.set(
        "binary_sensor.smoke".parse().unwrap(),
        "on",
        HashMap::new(),
        Context::new(),
    );
    manager.start();
    settle().await;

    let rollup = store.get("binary_sensor.compliance_home").unwrap();
    assert_eq!(rollup.state, "on");
    assert_eq!(rollup.attribute(attributes::SEVERITY), Some(&json!(0)));
    assert_eq!(
        rollup.attribute(attributes::SEVERITY_LABEL),
        Some(&json!("Critical"))
    );

    // The smoke alarm clears; the roll-up drops to the doors' warning
    store.set(
        "binary_sensor.smoke".parse().unwrap(),
        "off",
        HashMap::new(),
        Context::new(),
    );
    settle().await;

    let rollup = store.get("binary_sensor.compliance_home").unwrap();
    assert_eq!(rollup.state, "on");
    assert_eq!(rollup.attribute(attributes::SEVERITY), Some(&json!(2)));

    manager.shutdown().await;
}

#[tokio::test]
async fn reload_picks_up_new_area_members() {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(StateStore::new(bus.clone()));
    let entities = Arc::new(EntityRegistry::new());
    let devices = Arc::new(DeviceRegistry::new());
    entities.register(EntityEntry::new("binary_sensor.window_a").with_area("attic"));

    let config = ManagerConfig::from_yaml(
        r#"
sensors:
  - name: Attic
    rules:
      - target:
          area_id: attic
        condition:
          expected_state: "off"
"#,
    )
    .unwrap();

    let mut manager = ComplianceManager::new(
        config.clone(),
        store.clone(),
        bus,
        entities.clone(),
        devices,
    )
    .unwrap();

    {
        let sensor = manager.sensor("binary_sensor.compliance_attic").unwrap();
        assert_eq!(sensor.lock().await.tracked_entities().len(), 1);
    }

    // A new window appears in the area; only a reload resolves it in
    entities.register(EntityEntry::new("binary_sensor.window_b").with_area("attic"));
    manager.reload(config).await.unwrap();

    let sensor = manager.sensor("binary_sensor.compliance_attic").unwrap();
    let tracked = sensor.lock().await.tracked_entities().clone();
    assert!(tracked.contains("binary_sensor.window_b"));
    assert_eq!(tracked.len(), 2);

    manager.shutdown().await;
}
