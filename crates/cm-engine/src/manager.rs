//! Compliance manager
//!
//! Owns every configured sensor and the optional global aggregator,
//! wires them to the event bus, and runs their evaluation loops. Each
//! sensor re-evaluates when a tracked entity changes state or one of
//! its timers fires; the aggregator re-evaluates when a source sensor
//! publishes.

use std::sync::Arc;
use std::time::Duration;

use cm_core::events::StateChangedData;
use cm_event_bus::EventBus;
use cm_registries::{DeviceRegistry, EntityRegistry};
use cm_state_store::StateStore;
use cm_template::TemplateEngine;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, trace};

use crate::aggregate::{GlobalAggregator, GlobalConfig};
use crate::error::EngineError;
use crate::resolver::TargetResolver;
use crate::sensor::{ComplianceSensor, PersistedSensorState, SensorConfig};

/// Top-level configuration: all sensors plus the optional roll-up
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalConfig>,

    /// Turn debug attributes on for every sensor
    #[serde(default)]
    pub show_debug_attributes: bool,
}

impl ManagerConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, EngineError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

struct SensorSlot {
    entity_id: String,
    sensor: Arc<Mutex<ComplianceSensor>>,
}

/// Builds and runs all compliance sensors
pub struct ComplianceManager {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    entities: Arc<EntityRegistry>,
    devices: Arc<DeviceRegistry>,
    sensors: Vec<SensorSlot>,
    aggregator: Option<Arc<GlobalAggregator>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ComplianceManager {
    /// Build all sensors from configuration
    ///
    /// Fails without side effects when any sensor is misconfigured, so
    /// callers can keep a previous instance running on a bad reload.
    pub fn new(
        config: ManagerConfig,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        entities: Arc<EntityRegistry>,
        devices: Arc<DeviceRegistry>,
    ) -> Result<Self, EngineError> {
        let templates = Arc::new(TemplateEngine::new(store.clone()));
        let resolver = TargetResolver::new(entities.clone(), devices.clone());

        let mut sensors: Vec<SensorSlot> = Vec::with_capacity(config.sensors.len());
        for sensor_config in &config.sensors {
            let mut effective = sensor_config.clone();
            effective.show_debug_attributes |= config.show_debug_attributes;

            let sensor =
                ComplianceSensor::new(effective, store.clone(), templates.clone(), &resolver)?;
            let entity_id = sensor.entity_id().to_string();
            if sensors.iter().any(|slot| slot.entity_id == entity_id) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate sensor entity id {entity_id}"
                )));
            }
            sensors.push(SensorSlot {
                entity_id,
                sensor: Arc::new(Mutex::new(sensor)),
            });
        }

        let aggregator = config
            .global
            .map(|global| GlobalAggregator::new(global, store.clone()))
            .transpose()?
            .map(Arc::new);

        info!(
            sensors = sensors.len(),
            aggregated = aggregator.is_some(),
            "Compliance manager built"
        );
        Ok(Self {
            store,
            bus,
            entities,
            devices,
            sensors,
            aggregator,
            tasks: Vec::new(),
        })
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Handle to a managed sensor by its entity id
    pub fn sensor(&self, entity_id: &str) -> Option<Arc<Mutex<ComplianceSensor>>> {
        self.sensors
            .iter()
            .find(|slot| slot.entity_id == entity_id)
            .map(|slot| slot.sensor.clone())
    }

    /// Spawn the evaluation loops; each sensor evaluates once on start
    pub fn start(&mut self) {
        for slot in &self.sensors {
            self.tasks
                .push(tokio::spawn(run_sensor(slot.sensor.clone(), self.bus.clone())));
        }
        if let Some(aggregator) = &self.aggregator {
            self.tasks.push(tokio::spawn(run_aggregator(
                aggregator.clone(),
                self.bus.clone(),
            )));
        }
    }

    /// Snooze violations on one sensor; empty targets snooze all active
    pub async fn snooze(
        &self,
        sensor_id: &str,
        targets: &[String],
        duration: Duration,
    ) -> Result<(), EngineError> {
        let sensor = self
            .sensor(sensor_id)
            .ok_or_else(|| EngineError::SensorNotFound(sensor_id.to_string()))?;
        sensor.lock().await.snooze(targets, duration);
        Ok(())
    }

    /// Restore a sensor's timer registries from persistence
    pub async fn restore(
        &self,
        sensor_id: &str,
        persisted: &PersistedSensorState,
    ) -> Result<(), EngineError> {
        let sensor = self
            .sensor(sensor_id)
            .ok_or_else(|| EngineError::SensorNotFound(sensor_id.to_string()))?;
        sensor.lock().await.restore(persisted);
        Ok(())
    }

    /// Snapshot a sensor's timer registries for persistence
    pub async fn persisted_state(
        &self,
        sensor_id: &str,
    ) -> Result<PersistedSensorState, EngineError> {
        let sensor = self
            .sensor(sensor_id)
            .ok_or_else(|| EngineError::SensorNotFound(sensor_id.to_string()))?;
        let snapshot = sensor.lock().await.persisted_state();
        Ok(snapshot)
    }

    /// Replace the running set with a freshly built one
    ///
    /// Also the way registry changes are picked up: target resolution
    /// happens at build time, so new area or label members only join a
    /// sensor's tracked set here.
    pub async fn reload(&mut self, config: ManagerConfig) -> Result<(), EngineError> {
        let mut replacement = Self::new(
            config,
            self.store.clone(),
            self.bus.clone(),
            self.entities.clone(),
            self.devices.clone(),
        )?;
        self.shutdown().await;
        std::mem::swap(self, &mut replacement);
        self.start();
        info!(sensors = self.sensors.len(), "Compliance manager reloaded");
        Ok(())
    }

    /// Stop all loops and cancel every timer
    pub async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for slot in &self.sensors {
            slot.sensor.lock().await.shutdown();
        }
    }
}

async fn run_sensor(sensor: Arc<Mutex<ComplianceSensor>>, bus: Arc<EventBus>) {
    // Subscribe before the initial evaluation so no change slips between
    let mut events = bus.subscribe_typed::<StateChangedData>();
    let (tracked, timers) = {
        let mut guard = sensor.lock().await;
        let tracked = guard.tracked_entities().clone();
        let timers = guard.take_timer_rx();
        guard.evaluate();
        (tracked, timers)
    };
    let Some(mut timers) = timers else {
        // Run loop already consumed the receiver once
        return;
    };

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let entity_id = event.data.entity_id.to_string();
                        if tracked.contains(&entity_id) {
                            trace!(entity_id, "Tracked entity changed");
                            sensor.lock().await.evaluate_with_context(&event.context);
                        }
                    }
                    // Missed events; a full pass catches up
                    Err(RecvError::Lagged(_)) => sensor.lock().await.evaluate(),
                    Err(RecvError::Closed) => break,
                }
            }
            fired = timers.recv() => {
                let Some(fired) = fired else { break };
                trace!(key = %fired.key, "Timer fired");
                sensor.lock().await.evaluate();
            }
        }
    }
}

async fn run_aggregator(aggregator: Arc<GlobalAggregator>, bus: Arc<EventBus>) {
    let mut events = bus.subscribe_typed::<StateChangedData>();
    aggregator.evaluate();
    loop {
        match events.recv().await {
            Ok(event) => {
                let entity_id = event.data.entity_id.to_string();
                if aggregator.sources().iter().any(|source| *source == entity_id) {
                    aggregator.evaluate_with_context(&event.context);
                }
            }
            Err(RecvError::Lagged(_)) => aggregator.evaluate(),
            Err(RecvError::Closed) => break,
        }
    }
}
