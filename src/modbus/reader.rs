//! Poll engine: periodic block reads into a value snapshot, plus writes

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::client::ModbusError;
use super::planner::{plan_blocks, PlannerConfig, ReadBlock};
use super::ConnectionManager;
use crate::codec::{self, EncodeError, Raw, Value};
use crate::config::PollingConfig;
use crate::registers::{Address, AddressSpace, DataPoint, RegisterMap};

/// Latest decoded value of every enabled data point
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// `None` marks a point that could not be read
    pub values: HashMap<String, Option<Value>>,
    /// When the cycle that produced this snapshot finished
    pub updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.values.get(id).and_then(Option::as_ref)
    }
}

/// Notification sent to subscribers
#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    /// A full cycle finished and replaced the snapshot
    Refreshed(Arc<Snapshot>),
    /// One data point was re-read outside the cycle
    PointRefreshed { id: String, value: Option<Value> },
    /// The controller was unreachable; every value is absent
    CycleFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Could not connect to Modbus device")]
    CycleFailed,
    #[error("Unknown data point: {0}")]
    UnknownDataPoint(String),
    #[error("Data point {0} is not enabled")]
    NotEnabled(String),
    #[error("Polling has been shut down")]
    ShutDown,
    #[error("Failed to read {id}: {source}")]
    Read { id: String, source: ModbusError },
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Unknown data point: {0}")]
    UnknownDataPoint(String),
    #[error("Data point {0} is not enabled")]
    NotEnabled(String),
    #[error("Write to {0} refused, polling has been shut down")]
    ShutDown(String),
    #[error("Write to {id} rejected: {source}")]
    Rejected { id: String, source: EncodeError },
    #[error("Write to {id} failed: {source}")]
    Modbus { id: String, source: ModbusError },
}

impl WriteError {
    /// Refused before any device I/O
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            WriteError::UnknownDataPoint(_)
                | WriteError::NotEnabled(_)
                | WriteError::Rejected { .. }
        )
    }
}

/// Enabled points and the block reads that cover them
#[derive(Debug, Default)]
pub struct PollPlan {
    pub points: Vec<Arc<DataPoint>>,
    pub blocks: Vec<ReadBlock>,
}

impl PollPlan {
    pub fn new(points: Vec<Arc<DataPoint>>, config: PlannerConfig) -> Self {
        let blocks = plan_blocks(&points, config);
        Self { points, blocks }
    }

    fn contains(&self, id: &str) -> bool {
        self.points.iter().any(|p| p.id == id)
    }
}

/// Drives poll cycles for one controller and owns its snapshot
pub struct Coordinator {
    registers: Arc<RegisterMap>,
    connection: Arc<ConnectionManager>,
    planner: PlannerConfig,
    update_interval: Duration,
    plan: RwLock<Arc<PollPlan>>,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes full cycles and single-point refreshes
    cycle: Mutex<()>,
    events: broadcast::Sender<SnapshotEvent>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(
        registers: Arc<RegisterMap>,
        connection: Arc<ConnectionManager>,
        config: &PollingConfig,
    ) -> Self {
        let planner = config.planner();
        let points = registers.select(&config.enabled, &config.categories);
        let plan = PollPlan::new(points, planner);
        info!(
            "Polling {} data points in {} blocks every {}s",
            plan.points.len(),
            plan.blocks.len(),
            config.update_interval_secs
        );

        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);

        Self {
            registers,
            connection,
            planner,
            update_interval: config.update_interval(),
            plan: RwLock::new(Arc::new(plan)),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            cycle: Mutex::new(()),
            events,
            shutdown,
        }
    }

    pub fn registers(&self) -> &Arc<RegisterMap> {
        &self.registers
    }

    /// Subscribe to snapshot updates
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    /// Current value of `id`, `None` when absent
    pub async fn value(&self, id: &str) -> Option<Value> {
        self.snapshot.read().await.get(id).cloned()
    }

    pub async fn plan(&self) -> Arc<PollPlan> {
        self.plan.read().await.clone()
    }

    /// Replace the enabled set and rebuild the block plan
    pub async fn set_enabled(&self, ids: &[String], categories: &[String]) {
        let points = self.registers.select(ids, categories);
        let plan = PollPlan::new(points, self.planner);
        info!(
            "Enabled set changed: {} data points in {} blocks",
            plan.points.len(),
            plan.blocks.len()
        );
        *self.plan.write().await = Arc::new(plan);
    }

    /// Run one full poll cycle and publish the new snapshot.
    ///
    /// When the controller cannot be reached every value becomes absent
    /// and `PollError::CycleFailed` is returned.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, PollError> {
        let _cycle = self.cycle.lock().await;
        if self.is_shut_down() {
            return Err(PollError::ShutDown);
        }
        let started = std::time::Instant::now();
        let plan = self.plan().await;

        if !self.connection.ensure_connected().await {
            let snapshot = Arc::new(Snapshot {
                values: plan.points.iter().map(|p| (p.id.clone(), None)).collect(),
                updated_at: Some(Utc::now()),
            });
            *self.snapshot.write().await = snapshot;
            let _ = self.events.send(SnapshotEvent::CycleFailed);
            metrics::counter!("lambdatronic_poll_cycles_total", "outcome" => "failed")
                .increment(1);
            return Err(PollError::CycleFailed);
        }

        let mut values = HashMap::with_capacity(plan.points.len());
        for block in &plan.blocks {
            self.read_block(block, &mut values).await;
        }

        for point in &plan.points {
            if let Some(source) = point.source() {
                let derived = codec::derive_flag(values.get(source).and_then(Option::as_ref));
                values.insert(point.id.clone(), derived);
            }
        }

        let absent = values.values().filter(|v| v.is_none()).count();
        let snapshot = Arc::new(Snapshot {
            values,
            updated_at: Some(Utc::now()),
        });
        *self.snapshot.write().await = snapshot.clone();
        let _ = self.events.send(SnapshotEvent::Refreshed(snapshot.clone()));

        let elapsed = started.elapsed();
        metrics::counter!("lambdatronic_poll_cycles_total", "outcome" => "ok").increment(1);
        metrics::histogram!("lambdatronic_poll_cycle_seconds").record(elapsed.as_secs_f64());
        debug!(
            "Poll cycle finished in {:?}: {} values, {} absent",
            elapsed,
            snapshot.values.len(),
            absent
        );

        Ok(snapshot)
    }

    async fn read_block(&self, block: &ReadBlock, values: &mut HashMap<String, Option<Value>>) {
        let result = self.read_raw(block.space, block.wire_start, block.count).await;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                debug!(
                    "Failed to read {} block at address {}: {}",
                    block.space, block.start, e
                );
                metrics::counter!(
                    "lambdatronic_block_reads_failed_total",
                    "space" => block.space.as_str()
                )
                .increment(1);
                for id in &block.members {
                    values.insert(id.clone(), None);
                }
                return;
            }
        };

        for id in &block.members {
            let value = self.registers.get(id).and_then(|point| {
                let offset = point.address().and_then(|a| block.offset_of(&a))?;
                let raw = raw.at(offset)?;
                codec::decode(&point.kind, raw)
            });
            values.insert(id.clone(), value);
        }
    }

    async fn read_raw(
        &self,
        space: AddressSpace,
        wire: u16,
        count: u16,
    ) -> Result<RawReading, ModbusError> {
        let reading = match space {
            AddressSpace::Coil => RawReading::Bits(self.connection.read_coils(wire, count).await?),
            AddressSpace::DiscreteInput => {
                RawReading::Bits(self.connection.read_discrete_inputs(wire, count).await?)
            }
            AddressSpace::InputRegister => {
                RawReading::Words(self.connection.read_input_registers(wire, count).await?)
            }
            AddressSpace::HoldingRegister => {
                RawReading::Words(self.connection.read_holding_registers(wire, count).await?)
            }
        };
        Ok(reading)
    }

    async fn read_point(&self, point: &DataPoint, address: Address) -> Result<Option<Value>, PollError> {
        let reading = self
            .read_raw(address.space, address.wire(), 1)
            .await
            .map_err(|source| PollError::Read {
                id: point.id.clone(),
                source,
            })?;
        Ok(reading.at(0).and_then(|raw| codec::decode(&point.kind, raw)))
    }

    /// Re-read a single enabled data point and update just that key.
    ///
    /// A derived point re-reads its source; enabled points derived from the
    /// refreshed one are recomputed. The snapshot is left untouched when the
    /// read fails.
    pub async fn refresh_one(&self, id: &str) -> Result<Option<Value>, PollError> {
        let _cycle = self.cycle.lock().await;
        if self.is_shut_down() {
            return Err(PollError::ShutDown);
        }

        let point = self
            .registers
            .get(id)
            .ok_or_else(|| PollError::UnknownDataPoint(id.to_string()))?;
        let plan = self.plan().await;
        if !plan.contains(id) {
            return Err(PollError::NotEnabled(id.to_string()));
        }
        let target = match point.source() {
            Some(source) => self
                .registers
                .get(source)
                .ok_or_else(|| PollError::UnknownDataPoint(source.to_string()))?,
            None => point,
        };
        let address = target
            .address()
            .ok_or_else(|| PollError::UnknownDataPoint(target.id.clone()))?;

        let value = match self.read_point(target, address).await {
            Ok(value) => value,
            Err(e) => {
                debug!("Failed to refresh data point {}: {}", id, e);
                return Err(e);
            }
        };

        let mut changed = vec![(target.id.clone(), value.clone())];
        for dependent in self.registers.dependents(&target.id) {
            if dependent.id == id || plan.contains(&dependent.id) {
                changed.push((dependent.id.clone(), codec::derive_flag(value.as_ref())));
            }
        }

        {
            let mut guard = self.snapshot.write().await;
            let snapshot = Arc::make_mut(&mut guard);
            for (key, value) in &changed {
                snapshot.values.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &changed {
            let _ = self.events.send(SnapshotEvent::PointRefreshed {
                id: key.clone(),
                value: value.clone(),
            });
        }

        Ok(changed
            .into_iter()
            .find(|(key, _)| key == id)
            .and_then(|(_, value)| value))
    }

    /// Validate, encode and write a value, then re-read the point.
    ///
    /// Validation failures never reach the device. A successful write only
    /// means the controller accepted the request; the refreshed snapshot
    /// shows what it actually stored.
    pub async fn write(&self, id: &str, value: &Value) -> Result<(), WriteError> {
        if self.is_shut_down() {
            return Err(WriteError::ShutDown(id.to_string()));
        }
        let point = self
            .registers
            .get(id)
            .ok_or_else(|| WriteError::UnknownDataPoint(id.to_string()))?;
        if !self.plan().await.contains(id) {
            return Err(WriteError::NotEnabled(id.to_string()));
        }

        let (address, word) = codec::encode(point, value).map_err(|source| {
            metrics::counter!("lambdatronic_writes_total", "outcome" => "rejected").increment(1);
            WriteError::Rejected {
                id: id.to_string(),
                source,
            }
        })?;

        if let Err(source) = self
            .connection
            .write_holding_register(address.wire(), word)
            .await
        {
            metrics::counter!("lambdatronic_writes_total", "outcome" => "failed").increment(1);
            return Err(WriteError::Modbus {
                id: id.to_string(),
                source,
            });
        }

        metrics::counter!("lambdatronic_writes_total", "outcome" => "ok").increment(1);
        info!("Wrote {} = {} (raw {} at {})", id, value, word, address.number);

        if let Err(e) = self.refresh_one(id).await {
            debug!("Refresh after write to {} failed: {}", id, e);
        }
        Ok(())
    }

    /// Periodic driver: one cycle per `update_interval` until shutdown.
    ///
    /// Cycles never overlap; a slow cycle delays the next tick.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        info!(
            "Starting polling of {} every {:?}",
            self.connection.endpoint(),
            self.update_interval
        );

        let mut ticker = interval(self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick is immediate; startup already ran a cycle
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = async {
                    ticker.tick().await;
                    match self.refresh().await {
                        Ok(snapshot) => debug!("Published snapshot with {} values", snapshot.values.len()),
                        Err(e) => warn!("Poll cycle failed: {}", e),
                    }
                } => {}
            }
        }

        info!("Polling of {} stopped", self.connection.endpoint());
    }

    /// Stop the periodic driver and close the connection for good.
    ///
    /// Later cycles, refreshes and writes fail without touching the device.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.connection.close().await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

enum RawReading {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

impl RawReading {
    fn at(&self, offset: usize) -> Option<Raw> {
        match self {
            RawReading::Bits(bits) => bits.get(offset).copied().map(Raw::Bit),
            RawReading::Words(words) => words.get(offset).copied().map(Raw::Word),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::client::{BoxTransport, Connector, Request, Response, Transport};
    use crate::modbus::ReconnectPolicy;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio_modbus::Exception;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    const MAP: &str = r#"
tables:
  kesselzustand:
    values: { 1: Kessel Aus, 3: Heizen }
points:
  - { id: kesseltemperatur, category: kessel, kind: number, register: 30001, scaling: 2, decimals: 1 }
  - { id: abgastemperatur, category: kessel, kind: number, register: 30002 }
  - { id: saugzug_drehzahl, category: kessel, kind: number, register: 30005, signed: false }
  - { id: saugzug_laeuft, category: kessel, kind: bit_derived_boolean, source: saugzug_drehzahl }
  - { id: kesselzustand, category: zustand, kind: enum, register: 34002, table: kesselzustand }
  - { id: kesselpumpe, category: kessel, kind: boolean, coil: 1 }
  - { id: boiler_solltemperatur, category: boiler, kind: number, register: 41631, scaling: 2, writable: true, min: 10, max: 100 }
  - { id: hk1_betriebsart, category: heizkreis, kind: enum, register: 48047, writable: true, options: [Aus, Automatik, Extraheizen] }
"#;

    /// In-memory controller with switchable faults
    #[derive(Default)]
    struct Device {
        input: StdMutex<HashMap<u16, u16>>,
        holding: StdMutex<HashMap<u16, u16>>,
        coils: StdMutex<HashMap<u16, bool>>,
        /// Input register reads starting here answer with an exception
        failing_input_start: StdMutex<Option<u16>>,
        /// Input reads are cut short to this many words
        short_reads: StdMutex<Option<usize>>,
        /// Holding writes are stored clamped to this raw value
        clamp_writes: StdMutex<Option<u16>>,
        unreachable: AtomicBool,
        /// The next input read starting here waits on `gate` after sampling
        hold_input_start: StdMutex<Option<u16>>,
        held: Notify,
        gate: Notify,
        connects: AtomicUsize,
        requests: StdMutex<Vec<Request>>,
    }

    impl Device {
        fn words(map: &StdMutex<HashMap<u16, u16>>, addr: u16, cnt: u16) -> Vec<u16> {
            let map = map.lock().unwrap();
            (addr..addr + cnt)
                .map(|a| map.get(&a).copied().unwrap_or(0))
                .collect()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    struct DeviceConnector(Arc<Device>);
    struct DeviceSession(Arc<Device>);

    #[async_trait]
    impl Connector for DeviceConnector {
        async fn connect(&self) -> Result<BoxTransport, ModbusError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if self.0.unreachable.load(Ordering::SeqCst) {
                return Err(ModbusError::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )));
            }
            Ok(Box::new(DeviceSession(self.0.clone())))
        }

        fn endpoint(&self) -> String {
            "fake:502 (unit 2)".to_string()
        }
    }

    #[async_trait]
    impl Transport for DeviceSession {
        async fn call(&mut self, request: Request) -> Result<Response, ModbusError> {
            let device = &self.0;
            device.requests.lock().unwrap().push(request);
            match request {
                Request::ReadInputRegisters(addr, cnt) => {
                    if *device.failing_input_start.lock().unwrap() == Some(addr) {
                        return Err(ModbusError::Exception(Exception::IllegalDataAddress));
                    }
                    let mut words = Device::words(&device.input, addr, cnt);
                    if let Some(len) = *device.short_reads.lock().unwrap() {
                        words.truncate(len);
                    }
                    let hold = {
                        let mut hold = device.hold_input_start.lock().unwrap();
                        *hold == Some(addr) && hold.take().is_some()
                    };
                    if hold {
                        device.held.notify_one();
                        device.gate.notified().await;
                    }
                    Ok(Response::Words(words))
                }
                Request::ReadHoldingRegisters(addr, cnt) => {
                    Ok(Response::Words(Device::words(&device.holding, addr, cnt)))
                }
                Request::ReadCoils(addr, cnt) => {
                    let coils = device.coils.lock().unwrap();
                    Ok(Response::Bits(
                        (addr..addr + cnt)
                            .map(|a| coils.get(&a).copied().unwrap_or(false))
                            .collect(),
                    ))
                }
                Request::ReadDiscreteInputs(_, cnt) => {
                    Ok(Response::Bits(vec![false; usize::from(cnt)]))
                }
                Request::WriteSingleRegister(addr, value) => {
                    let stored = match *device.clamp_writes.lock().unwrap() {
                        Some(limit) => value.min(limit),
                        None => value,
                    };
                    device.holding.lock().unwrap().insert(addr, stored);
                    Ok(Response::Written)
                }
            }
        }
    }

    fn device() -> Arc<Device> {
        let device = Arc::new(Device::default());
        {
            let mut input = device.input.lock().unwrap();
            input.insert(0, 145); // 72.5 °C
            input.insert(1, 0xFFF6); // -10
            input.insert(4, 1450);
            input.insert(4001, 3);
        }
        device.holding.lock().unwrap().insert(1630, 120);
        device.holding.lock().unwrap().insert(8046, 1);
        device.coils.lock().unwrap().insert(1, true);
        device
    }

    fn coordinator_with(device: &Arc<Device>, config: PollingConfig) -> Coordinator {
        let registers = Arc::new(RegisterMap::from_yaml(MAP).unwrap());
        let connection = Arc::new(ConnectionManager::new(
            Box::new(DeviceConnector(device.clone())),
            ReconnectPolicy {
                reconnect_delay: Duration::from_secs(30),
                attempt_interval: Duration::from_secs(1),
                retries: 0,
            },
        ));
        Coordinator::new(registers, connection, &config)
    }

    fn coordinator(device: &Arc<Device>) -> Coordinator {
        coordinator_with(device, PollingConfig::default())
    }

    #[tokio::test]
    async fn test_full_cycle_decodes_every_kind() {
        let device = device();
        let coordinator = coordinator(&device);

        let snapshot = coordinator.refresh().await.unwrap();

        assert_eq!(snapshot.get("kesseltemperatur"), Some(&Value::Decimal(72.5)));
        assert_eq!(snapshot.get("abgastemperatur"), Some(&Value::Integer(-10)));
        assert_eq!(snapshot.get("saugzug_drehzahl"), Some(&Value::Integer(1450)));
        assert_eq!(snapshot.get("saugzug_laeuft"), Some(&Value::Bool(true)));
        assert_eq!(
            snapshot.get("kesselzustand"),
            Some(&Value::Text("Heizen".to_string()))
        );
        assert_eq!(snapshot.get("kesselpumpe"), Some(&Value::Bool(true)));
        assert_eq!(snapshot.get("boiler_solltemperatur"), Some(&Value::Integer(60)));
        assert_eq!(
            snapshot.get("hk1_betriebsart"),
            Some(&Value::Text("Automatik".to_string()))
        );
        assert!(snapshot.updated_at.is_some());
        assert_eq!(
            coordinator.value("kesseltemperatur").await,
            Some(Value::Decimal(72.5))
        );
    }

    #[tokio::test]
    async fn test_cycle_issues_one_request_per_block() {
        let device = device();
        let coordinator = coordinator(&device);
        let blocks = coordinator.plan().await.blocks.len();

        coordinator.refresh().await.unwrap();

        assert_eq!(device.request_count(), blocks);
        let requests = device.requests.lock().unwrap().clone();
        assert!(requests.contains(&Request::ReadInputRegisters(0, 5)));
        assert!(requests.contains(&Request::ReadCoils(1, 1)));
    }

    #[tokio::test]
    async fn test_unreachable_device_fails_the_cycle() {
        let device = device();
        device.unreachable.store(true, Ordering::SeqCst);
        let coordinator = coordinator(&device);
        let mut events = coordinator.subscribe();

        let result = coordinator.refresh().await;

        assert!(matches!(result, Err(PollError::CycleFailed)));
        let snapshot = coordinator.snapshot().await;
        assert_eq!(snapshot.values.len(), 8);
        assert!(snapshot.values.values().all(Option::is_none));
        assert!(matches!(events.recv().await, Ok(SnapshotEvent::CycleFailed)));
        assert_eq!(device.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_block_only_blanks_its_members() {
        let device = device();
        *device.failing_input_start.lock().unwrap() = Some(0);
        let coordinator = coordinator(&device);

        let snapshot = coordinator.refresh().await.unwrap();

        assert_eq!(snapshot.values.get("kesseltemperatur"), Some(&None));
        assert_eq!(snapshot.values.get("saugzug_drehzahl"), Some(&None));
        // derived from an absent source stays absent, not false
        assert_eq!(snapshot.values.get("saugzug_laeuft"), Some(&None));
        assert_eq!(
            snapshot.get("kesselzustand"),
            Some(&Value::Text("Heizen".to_string()))
        );
        assert_eq!(snapshot.get("kesselpumpe"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_short_response_marks_tail_absent() {
        let device = device();
        *device.short_reads.lock().unwrap() = Some(2);
        let coordinator = coordinator(&device);

        let snapshot = coordinator.refresh().await.unwrap();

        assert_eq!(snapshot.get("kesseltemperatur"), Some(&Value::Decimal(72.5)));
        assert_eq!(snapshot.get("abgastemperatur"), Some(&Value::Integer(-10)));
        assert_eq!(snapshot.values.get("saugzug_drehzahl"), Some(&None));
    }

    #[tokio::test]
    async fn test_derived_flag_follows_source() {
        let device = device();
        device.input.lock().unwrap().insert(4, 0);
        let coordinator = coordinator(&device);

        let snapshot = coordinator.refresh().await.unwrap();
        assert_eq!(snapshot.get("saugzug_laeuft"), Some(&Value::Bool(false)));
    }

    #[tokio::test]
    async fn test_enabled_subset_and_replanning() {
        let device = device();
        let config = PollingConfig {
            enabled: vec!["saugzug_laeuft".to_string()],
            ..PollingConfig::default()
        };
        let coordinator = coordinator_with(&device, config);

        let snapshot = coordinator.refresh().await.unwrap();
        let keys: HashSet<&str> = snapshot.values.keys().map(String::as_str).collect();
        assert_eq!(keys, HashSet::from(["saugzug_drehzahl", "saugzug_laeuft"]));
        assert_eq!(
            device.requests.lock().unwrap().clone(),
            vec![Request::ReadInputRegisters(4, 1)]
        );

        coordinator
            .set_enabled(&[], &["zustand".to_string()])
            .await;
        let snapshot = coordinator.refresh().await.unwrap();
        let keys: Vec<&str> = snapshot.values.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["kesselzustand"]);
    }

    #[tokio::test]
    async fn test_write_encodes_and_refreshes() {
        let device = device();
        let coordinator = coordinator(&device);
        coordinator.refresh().await.unwrap();
        let mut events = coordinator.subscribe();

        assert_ok!(
            coordinator
                .write("boiler_solltemperatur", &Value::Decimal(55.0))
                .await
        );

        assert_eq!(device.holding.lock().unwrap().get(&1630), Some(&110));
        assert_eq!(
            coordinator.value("boiler_solltemperatur").await,
            Some(Value::Integer(55))
        );
        match events.recv().await {
            Ok(SnapshotEvent::PointRefreshed { id, value }) => {
                assert_eq!(id, "boiler_solltemperatur");
                assert_eq!(value, Some(Value::Integer(55)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        let last = device.requests.lock().unwrap().last().copied();
        assert_eq!(last, Some(Request::ReadHoldingRegisters(1630, 1)));
    }

    #[tokio::test]
    async fn test_write_option_by_label() {
        let device = device();
        let coordinator = coordinator(&device);

        assert_ok!(
            coordinator
                .write("hk1_betriebsart", &Value::Text("Extraheizen".to_string()))
                .await
        );
        assert_eq!(device.holding.lock().unwrap().get(&8046), Some(&2));
        assert_eq!(
            coordinator.value("hk1_betriebsart").await,
            Some(Value::Text("Extraheizen".to_string()))
        );
    }

    #[tokio::test]
    async fn test_invalid_writes_never_reach_the_device() {
        let device = device();
        let coordinator = coordinator(&device);

        let too_hot = assert_err!(
            coordinator
                .write("boiler_solltemperatur", &Value::Integer(120))
                .await
        );
        assert!(too_hot.is_rejected());
        assert!(matches!(
            too_hot,
            WriteError::Rejected {
                source: EncodeError::OutOfRange { .. },
                ..
            }
        ));

        let bad_option = assert_err!(
            coordinator
                .write("hk1_betriebsart", &Value::Text("Party".to_string()))
                .await
        );
        assert!(matches!(
            bad_option,
            WriteError::Rejected {
                source: EncodeError::UnknownOption(_),
                ..
            }
        ));

        let read_only = assert_err!(
            coordinator
                .write("kesseltemperatur", &Value::Integer(50))
                .await
        );
        assert!(matches!(
            read_only,
            WriteError::Rejected {
                source: EncodeError::InvalidDefinition(_),
                ..
            }
        ));

        let unknown = assert_err!(coordinator.write("nope", &Value::Integer(1)).await);
        assert!(unknown.is_rejected());

        assert_eq!(device.connects.load(Ordering::SeqCst), 0);
        assert_eq!(device.request_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_after_write_shows_device_value() {
        let device = device();
        *device.clamp_writes.lock().unwrap() = Some(160);
        let coordinator = coordinator(&device);

        assert_ok!(
            coordinator
                .write("boiler_solltemperatur", &Value::Integer(95))
                .await
        );
        assert_eq!(
            coordinator.value("boiler_solltemperatur").await,
            Some(Value::Integer(80))
        );
    }

    #[tokio::test]
    async fn test_write_to_unreachable_device_fails() {
        let device = device();
        device.unreachable.store(true, Ordering::SeqCst);
        let coordinator = coordinator(&device);

        let err = assert_err!(
            coordinator
                .write("boiler_solltemperatur", &Value::Integer(60))
                .await
        );
        assert!(!err.is_rejected());
        assert!(matches!(
            err,
            WriteError::Modbus {
                source: ModbusError::NotConnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_refresh_one_updates_derived_points() {
        let device = device();
        let coordinator = coordinator(&device);
        coordinator.refresh().await.unwrap();
        let before = coordinator.snapshot().await;

        device.input.lock().unwrap().insert(4, 0);
        let value = coordinator.refresh_one("saugzug_laeuft").await.unwrap();

        assert_eq!(value, Some(Value::Bool(false)));
        assert_eq!(
            coordinator.value("saugzug_drehzahl").await,
            Some(Value::Integer(0))
        );
        assert_eq!(
            coordinator.value("kesseltemperatur").await,
            Some(Value::Decimal(72.5))
        );
        // readers holding the old snapshot are unaffected
        assert_eq!(before.get("saugzug_laeuft"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_refresh_one_failure_keeps_value() {
        let device = device();
        let coordinator = coordinator(&device);
        coordinator.refresh().await.unwrap();

        *device.failing_input_start.lock().unwrap() = Some(0);
        assert!(matches!(
            coordinator.refresh_one("kesseltemperatur").await,
            Err(PollError::Read { .. })
        ));
        assert_eq!(
            coordinator.value("kesseltemperatur").await,
            Some(Value::Decimal(72.5))
        );
        assert!(matches!(
            coordinator.refresh_one("missing").await,
            Err(PollError::UnknownDataPoint(_))
        ));
    }

    #[tokio::test]
    async fn test_points_outside_enabled_set_are_refused() {
        let device = device();
        let config = PollingConfig {
            enabled: vec!["kesseltemperatur".to_string()],
            ..PollingConfig::default()
        };
        let coordinator = coordinator_with(&device, config);
        coordinator.refresh().await.unwrap();
        let requests = device.request_count();

        let err = assert_err!(
            coordinator
                .write("boiler_solltemperatur", &Value::Integer(55))
                .await
        );
        assert!(matches!(err, WriteError::NotEnabled(_)));
        assert!(err.is_rejected());
        assert!(matches!(
            coordinator.refresh_one("kesselzustand").await,
            Err(PollError::NotEnabled(_))
        ));

        assert_eq!(device.request_count(), requests);
        assert_eq!(device.holding.lock().unwrap().get(&1630), Some(&120));
        let snapshot = coordinator.snapshot().await;
        let keys: Vec<&str> = snapshot.values.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["kesseltemperatur"]);
        assert_eq!(coordinator.value("boiler_solltemperatur").await, None);
    }

    #[tokio::test]
    async fn test_nothing_reaches_the_device_after_shutdown() {
        let device = device();
        let coordinator = coordinator(&device);
        coordinator.refresh().await.unwrap();
        let before = coordinator.snapshot().await;

        coordinator.shutdown().await;
        assert!(coordinator.is_shut_down());
        let connects = device.connects.load(Ordering::SeqCst);
        let requests = device.request_count();

        assert!(matches!(
            coordinator.refresh().await,
            Err(PollError::ShutDown)
        ));
        assert!(matches!(
            coordinator.refresh_one("kesseltemperatur").await,
            Err(PollError::ShutDown)
        ));
        let err = assert_err!(
            coordinator
                .write("boiler_solltemperatur", &Value::Integer(55))
                .await
        );
        assert!(matches!(err, WriteError::ShutDown(_)));

        assert_eq!(device.connects.load(Ordering::SeqCst), connects);
        assert_eq!(device.request_count(), requests);
        assert_eq!(device.holding.lock().unwrap().get(&1630), Some(&120));
        assert!(Arc::ptr_eq(&before, &coordinator.snapshot().await));
    }

    #[tokio::test]
    async fn test_single_point_refresh_waits_for_running_cycle() {
        let device = device();
        *device.hold_input_start.lock().unwrap() = Some(0);
        let coordinator = Arc::new(coordinator(&device));

        let cycle = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        // the cycle has sampled 72.5 and is parked inside the block read
        device.held.notified().await;
        device.input.lock().unwrap().insert(0, 150);

        let single = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_one("kesseltemperatur").await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            device.requests.lock().unwrap().clone(),
            vec![Request::ReadCoils(1, 1), Request::ReadInputRegisters(0, 5)]
        );
        assert_eq!(coordinator.value("kesseltemperatur").await, None);

        device.gate.notify_one();
        let snapshot = cycle.await.unwrap().unwrap();
        assert_eq!(snapshot.get("kesseltemperatur"), Some(&Value::Decimal(72.5)));
        assert_eq!(
            single.await.unwrap().unwrap(),
            Some(Value::Decimal(75.0))
        );

        let requests = device.requests.lock().unwrap().clone();
        let blocks = coordinator.plan().await.blocks.len();
        assert_eq!(requests.len(), blocks + 1);
        assert_eq!(requests[blocks], Request::ReadInputRegisters(0, 1));
        assert_eq!(
            coordinator.value("kesseltemperatur").await,
            Some(Value::Decimal(75.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_until_shutdown() {
        let device = device();
        let config = PollingConfig {
            update_interval_secs: 10,
            ..PollingConfig::default()
        };
        let coordinator = Arc::new(coordinator_with(&device, config));
        let mut events = coordinator.subscribe();

        let driver = tokio::spawn(coordinator.clone().run());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(matches!(events.recv().await, Ok(SnapshotEvent::Refreshed(_))));
        assert!(matches!(events.recv().await, Ok(SnapshotEvent::Refreshed(_))));

        coordinator.shutdown().await;
        driver.await.unwrap();

        let connects = device.connects.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(device.connects.load(Ordering::SeqCst), connects);
        assert!(events.try_recv().is_err());
    }
}
