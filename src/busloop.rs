// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-bus background polling.
//!
//! Each bus path gets one [`BusLoop`] running on a dedicated worker
//! thread at the lowest scheduling class the OS offers.  The loop scans
//! the bus, attaches drivers for the devices it recognizes (routing them
//! through a channel switch when they sit behind one), polls every
//! sensor at its own pace, reconnects and eventually evicts sensors that
//! stop answering, and rescans with exponential backoff while expected
//! sensors are missing.  Consumers read the latest per-sensor snapshots
//! from the map this loop maintains; a per-sensor failure never
//! propagates out of the loop.

use crate::bus::BusManager;
use crate::detect::{self, DeviceInfo, ScanConfig, MUX_ADDRESS_MAX, MUX_ADDRESS_MIN};
use crate::mux::Mux;
use crate::sensor::{MuxRoute, SensorDriver};
use crate::sensors::{
    build_driver, driver_kind_for_address, now_ms, sensor_id, DriverKind, SensorData, SensorState,
    ERROR_KEY,
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Tunables consumed by the loop and its drivers.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Target period of one full polling pass.
    pub update_interval_ms: u64,
    /// Initial spacing between rescans while sensors are missing.
    pub rescan_interval_ms: u64,
    /// Ceiling for the rescan backoff.
    pub max_rescan_interval_ms: u64,
    /// Snapshots older than this are evicted; defaults to three update
    /// intervals.
    pub stale_state_timeout_ms: Option<u64>,
    /// Pause after each sensor read to yield bus time.
    pub sensor_read_delay_ms: u64,
    pub scan: ScanConfig,
}

impl Default for LoopConfig {
    fn default() -> LoopConfig {
        LoopConfig {
            update_interval_ms: 5_000,
            rescan_interval_ms: 15_000,
            max_rescan_interval_ms: 150_000,
            stale_state_timeout_ms: None,
            sensor_read_delay_ms: 100,
            scan: ScanConfig::default(),
        }
    }
}

impl LoopConfig {
    fn stale_timeout_ms(&self) -> u64 {
        self.stale_state_timeout_ms
            .unwrap_or(3 * self.update_interval_ms)
    }
}

/// Backoff rule for unproductive rescans: grow by 10% up to the cap,
/// reset to the initial interval whenever a scan finds something new.
fn next_rescan_interval(current: u64, initial: u64, max: u64, found_new: bool) -> u64 {
    if found_new {
        initial
    } else {
        ((current as f64 * 1.1) as u64).min(max)
    }
}

/// A driver-kind placeholder awaiting binding to a discovered sensor.
struct Expectation {
    kind: DriverKind,
    bound: Option<String>,
}

struct ActiveSensor {
    id: String,
    driver: Box<dyn SensorDriver>,
    last_read: Option<Instant>,
    needs_reconnect: bool,
    consecutive_failures: u32,
}

/// Reconnect attempts before an unresponsive sensor is evicted and left
/// for the next rescan to rediscover.
const MAX_RECONNECT_FAILURES: u32 = 3;

const MIN_SPACING_MS: u64 = 50;
const COOP_SLEEP_SLICE_MS: u64 = 50;

pub struct BusLoop {
    path: String,
    manager: Arc<BusManager>,
    config: LoopConfig,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    snapshots: Mutex<HashMap<String, SensorState>>,
    expectations: Mutex<Vec<Expectation>>,
}

impl BusLoop {
    pub fn new(path: &str, manager: Arc<BusManager>, config: LoopConfig) -> Arc<BusLoop> {
        Arc::new(BusLoop {
            path: path.to_string(),
            manager,
            config,
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
            snapshots: Mutex::new(HashMap::new()),
            expectations: Mutex::new(Vec::new()),
        })
    }

    /// The per-bus singleton for `/dev/i2c-<bus_index>`, with default
    /// configuration and the process-wide bus manager.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn get_instance(bus_index: u32) -> Arc<BusLoop> {
        use std::sync::OnceLock;
        static INSTANCES: OnceLock<Mutex<HashMap<u32, Arc<BusLoop>>>> = OnceLock::new();
        let instances = INSTANCES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut instances = instances.lock().unwrap_or_else(|p| p.into_inner());
        instances
            .entry(bus_index)
            .or_insert_with(|| {
                let path = format!("/dev/i2c-{}", bus_index);
                BusLoop::new(&path, BusManager::global(), LoopConfig::default())
            })
            .clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Declare which driver kinds this bus is expected to carry.  The
    /// loop binds each discovered sensor to the first unbound matching
    /// entry; sensors beyond the list are still polled.
    pub fn expect(&self, kinds: &[DriverKind]) {
        let mut expectations = lock(&self.expectations);
        *expectations = kinds
            .iter()
            .map(|&kind| Expectation { kind, bound: None })
            .collect();
    }

    /// Start the worker thread.  Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("i2chub-{}", self.path))
            .spawn(move || run(this));
        match spawned {
            Ok(handle) => {
                *lock(&self.thread) = Some(handle);
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                error!("{}: loop thread spawn failed: {}", self.path, e);
            }
        }
    }

    /// Stop the loop and wait for its cleanup to finish.  Idempotent.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("{}: loop thread panicked", self.path);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Point-in-time copy of every sensor's latest snapshot.
    pub fn get_all_sensor_state(&self) -> HashMap<String, SensorState> {
        lock(&self.snapshots).clone()
    }

    pub fn get_sensor_state(&self, sensor_id: &str) -> Option<SensorState> {
        lock(&self.snapshots).get(sensor_id).cloned()
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Sleep in small slices so cancellation is honored promptly.
    fn sleep_coop(&self, ms: u64) {
        let mut remaining = ms;
        while remaining > 0 && self.running() {
            let slice = remaining.min(COOP_SLEEP_SLICE_MS);
            thread::sleep(Duration::from_millis(slice));
            remaining -= slice;
        }
    }

    fn iteration_spacing_ms(&self, sensor_count: usize) -> u64 {
        let base = self.config.update_interval_ms / (sensor_count as u64 + 2);
        let spacing = base.max(MIN_SPACING_MS);
        if sensor_count == 0 {
            spacing * 2
        } else {
            spacing
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn lower_thread_priority(path: &str) {
    // The loop should never compete with the host application for CPU.
    unsafe {
        let param: libc::sched_param = std::mem::zeroed();
        if libc::sched_setscheduler(0, libc::SCHED_IDLE, &param) != 0
            && libc::setpriority(libc::PRIO_PROCESS as _, 0, 19) != 0
        {
            debug!("{}: could not lower loop thread priority", path);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn lower_thread_priority(_path: &str) {}

fn run(bl: Arc<BusLoop>) {
    lower_thread_priority(&bl.path);
    info!("{}: bus loop started", bl.path);

    let mut sensors: Vec<ActiveSensor> = Vec::new();
    let mut muxes: Vec<Arc<Mux>> = Vec::new();
    let mut rescan_interval = bl.config.rescan_interval_ms;
    let mut last_rescan = Instant::now();

    if bl.running() {
        scan_and_attach(&bl, &mut sensors, &mut muxes);
        last_rescan = Instant::now();
    }

    while bl.running() {
        let spacing = bl.iteration_spacing_ms(sensors.len());

        for index in 0..sensors.len() {
            if !bl.running() {
                break;
            }
            poll_sensor(&bl, &mut sensors[index]);
            bl.sleep_coop(bl.config.sensor_read_delay_ms);
        }

        if bl.running() {
            reconnect_sweep(&bl, &mut sensors);
            evict_stale(&bl);
            refresh_mux_snapshots(&bl, &muxes);

            let expected = lock(&bl.expectations).len();
            let reconnect_pending = sensors.iter().any(|s| s.needs_reconnect);
            let rescan_due = last_rescan.elapsed() >= Duration::from_millis(rescan_interval);
            if rescan_due && (reconnect_pending || sensors.len() < expected) {
                let found_new = scan_and_attach(&bl, &mut sensors, &mut muxes);
                rescan_interval = next_rescan_interval(
                    rescan_interval,
                    bl.config.rescan_interval_ms,
                    bl.config.max_rescan_interval_ms,
                    found_new,
                );
                last_rescan = Instant::now();
                debug!(
                    "{}: rescan {}, next in {} ms",
                    bl.path,
                    if found_new { "productive" } else { "unproductive" },
                    rescan_interval
                );
            }
        }

        bl.sleep_coop(spacing);
    }

    shutdown(&bl, &mut sensors, &muxes);
    info!("{}: bus loop stopped", bl.path);
}

/// Scan the main bus and every switch channel, attach drivers for new
/// devices, and bind expectations.  Returns true when anything new was
/// attached.
fn scan_and_attach(
    bl: &Arc<BusLoop>,
    sensors: &mut Vec<ActiveSensor>,
    muxes: &mut Vec<Arc<Mux>>,
) -> bool {
    let mut found_new = false;

    let main_config = ScanConfig {
        include_multiplexer: true,
        ..bl.config.scan.clone()
    };
    let direct = match bl.manager.open_path(&bl.path) {
        Ok(bus) => {
            let scanned = detect::scan_on(&bus, &main_config);
            bl.manager.release_path(&bl.path);
            match scanned {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("{}: main bus scan failed: {}", bl.path, e);
                    Vec::new()
                }
            }
        }
        Err(e) => {
            warn!("{}: could not open bus for scan: {}", bl.path, e);
            return false;
        }
    };

    // Attach a switch driver for every TCA-family address seen.
    for info in &direct {
        let is_mux = (MUX_ADDRESS_MIN..=MUX_ADDRESS_MAX).contains(&info.address);
        if !is_mux || muxes.iter().any(|m| m.address() == info.address) {
            continue;
        }
        match Mux::new(bl.manager.clone(), &bl.path, info.address) {
            Ok(mux) => match mux.connect() {
                Ok(()) => {
                    info!("{}: multiplexer at {:#04x} attached", bl.path, info.address);
                    muxes.push(mux);
                    found_new = true;
                }
                Err(e) => {
                    warn!(
                        "{}: multiplexer at {:#04x} failed to connect: {}",
                        bl.path, info.address, e
                    );
                }
            },
            Err(e) => warn!("{}: {}", bl.path, e),
        }
    }

    // Sweep every connected switch.
    let channel_config = ScanConfig {
        include_multiplexer: false,
        ..bl.config.scan.clone()
    };
    let mut behind: Vec<(Arc<Mux>, DeviceInfo)> = Vec::new();
    for mux in muxes.iter() {
        if !mux.is_ready() && mux.connect().is_err() {
            continue;
        }
        match mux.scan_all_channels(&channel_config) {
            Ok(map) => {
                for devices in map.channels.into_values() {
                    for device in devices {
                        behind.push((mux.clone(), device));
                    }
                }
            }
            Err(e) => warn!("{}: channel sweep of {:#04x} failed: {}", bl.path, mux.address(), e),
        }
    }

    // A device directly on the main bus wins over the same address seen
    // through a switch channel.
    let direct_addresses: HashSet<u8> = direct.iter().map(|d| d.address).collect();
    behind.retain(|(_, d)| !direct_addresses.contains(&d.address));

    let attachable = direct
        .into_iter()
        .filter(|d| !(MUX_ADDRESS_MIN..=MUX_ADDRESS_MAX).contains(&d.address))
        .map(|d| (None, d))
        .chain(behind.into_iter().map(|(mux, d)| (Some(mux), d)));

    for (mux, info) in attachable {
        let Some(kind) = driver_kind_for_address(info.address) else {
            debug!(
                "{}: no driver for device at {:#04x}",
                bl.path, info.address
            );
            continue;
        };
        let id = sensor_id(&bl.path, info.channel, info.address);
        if sensors.iter().any(|s| s.id == id) {
            continue;
        }
        let route = match (mux, info.channel) {
            (Some(mux), Some(channel)) => Some(MuxRoute { mux, channel }),
            _ => None,
        };
        let mut driver = build_driver(kind, bl.manager.clone(), &bl.path, info.address, route);
        let connected = driver.connect();
        if connected {
            bind_expectation(bl, kind, &id);
        } else {
            warn!("{}: {} did not connect, will retry", id, kind);
        }
        sensors.push(ActiveSensor {
            id,
            driver,
            last_read: None,
            needs_reconnect: !connected,
            consecutive_failures: u32::from(!connected),
        });
        found_new = true;
    }

    found_new
}

fn bind_expectation(bl: &Arc<BusLoop>, kind: DriverKind, id: &str) {
    let mut expectations = lock(&bl.expectations);
    if let Some(slot) = expectations
        .iter_mut()
        .find(|e| e.kind == kind && e.bound.is_none())
    {
        slot.bound = Some(id.to_string());
        debug!("{}: bound to {} expectation", id, kind);
    }
}

fn poll_sensor(bl: &Arc<BusLoop>, sensor: &mut ActiveSensor) {
    if !sensor.driver.is_ready() {
        if !sensor.driver.connect() {
            sensor.needs_reconnect = true;
            return;
        }
        sensor.needs_reconnect = false;
    }

    if let (Some(min), Some(last)) = (sensor.driver.min_read_interval(), sensor.last_read) {
        if last.elapsed() < min {
            return;
        }
    }

    let readings = sensor.driver.read_data();
    let failed = readings.is_empty() || readings.contains_key(ERROR_KEY);
    if failed {
        sensor.consecutive_failures += 1;
        sensor.needs_reconnect = true;
    } else {
        sensor.consecutive_failures = 0;
        sensor.needs_reconnect = false;
        sensor.last_read = Some(Instant::now());
    }
    // Publish either way; a failed read leaves an entry whose error
    // message is set, which readers can distinguish from silence.
    let state = sensor.driver.sensor_state();
    lock(&bl.snapshots).insert(sensor.id.clone(), state);
}

fn reconnect_sweep(bl: &Arc<BusLoop>, sensors: &mut Vec<ActiveSensor>) {
    let mut evicted = Vec::new();
    for (index, sensor) in sensors.iter_mut().enumerate() {
        if !sensor.needs_reconnect || !bl.running() {
            continue;
        }
        sensor.driver.disconnect();
        if sensor.driver.connect() {
            info!("{}: reconnected", sensor.id);
            sensor.needs_reconnect = false;
            sensor.consecutive_failures = 0;
        } else {
            sensor.consecutive_failures += 1;
            if sensor.consecutive_failures >= MAX_RECONNECT_FAILURES {
                evicted.push(index);
            }
        }
    }
    for index in evicted.into_iter().rev() {
        let sensor = sensors.remove(index);
        warn!(
            "{}: evicted after {} failed reconnects",
            sensor.id, sensor.consecutive_failures
        );
        lock(&bl.snapshots).remove(&sensor.id);
        let mut expectations = lock(&bl.expectations);
        for slot in expectations.iter_mut() {
            if slot.bound.as_deref() == Some(sensor.id.as_str()) {
                slot.bound = None;
            }
        }
    }
}

fn evict_stale(bl: &Arc<BusLoop>) {
    let threshold = bl.config.stale_timeout_ms();
    let now = now_ms();
    lock(&bl.snapshots).retain(|id, state| {
        let stale = now.saturating_sub(state.updated_ms) > threshold;
        if stale {
            debug!("{}: snapshot went stale, dropping", id);
        }
        !stale
    });
}

fn refresh_mux_snapshots(bl: &Arc<BusLoop>, muxes: &[Arc<Mux>]) {
    for mux in muxes {
        let id = sensor_id(&bl.path, None, mux.address());
        let state = SensorState {
            sensor_id: id.clone(),
            connected: mux.is_ready(),
            updated_ms: now_ms(),
            error_message: None,
            data: SensorData::Mux {
                summary: mux.describe(),
            },
        };
        lock(&bl.snapshots).insert(id, state);
    }
}

/// Cleanup on cancellation: every step is independent so one failure
/// cannot keep the rest from running.
fn shutdown(bl: &Arc<BusLoop>, sensors: &mut Vec<ActiveSensor>, muxes: &[Arc<Mux>]) {
    for sensor in sensors.iter_mut() {
        sensor.driver.disconnect();
    }
    sensors.clear();
    for mux in muxes {
        if let Err(e) = mux.disable_all() {
            warn!("{}: disable-all on shutdown: {}", bl.path, e);
        }
        mux.disconnect();
    }
    bl.manager.force_close(&bl.path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    const PATH: &str = "/dev/i2c-0";

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn test_config() -> LoopConfig {
        LoopConfig {
            update_interval_ms: 200,
            rescan_interval_ms: 150,
            max_rescan_interval_ms: 2_000,
            stale_state_timeout_ms: None,
            sensor_read_delay_ms: 10,
            scan: ScanConfig::default(),
        }
    }

    fn wait_for<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = probe() {
                return Some(value);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn rescan_backoff_sequence() {
        assert_eq!(next_rescan_interval(15_000, 15_000, 150_000, false), 16_500);
        assert_eq!(next_rescan_interval(16_500, 15_000, 150_000, false), 18_150);
        assert_eq!(next_rescan_interval(149_000, 15_000, 150_000, false), 150_000);
        assert_eq!(next_rescan_interval(150_000, 15_000, 150_000, false), 150_000);
        // Any productive scan resets to the initial interval.
        assert_eq!(next_rescan_interval(80_000, 15_000, 150_000, true), 15_000);
    }

    #[test]
    fn spacing_bounds() {
        let bl = BusLoop::new(
            PATH,
            Arc::new(BusManager::with_transport(Arc::new(MockTransport::new()))),
            LoopConfig::default(),
        );
        // 5000 / (2 + 2)
        assert_eq!(bl.iteration_spacing_ms(2), 1_250);
        // Bounded below, doubled when no sensors are present.
        assert_eq!(bl.iteration_spacing_ms(0), 5_000);
        let bl = BusLoop::new(
            PATH,
            Arc::new(BusManager::with_transport(Arc::new(MockTransport::new()))),
            LoopConfig {
                update_interval_ms: 100,
                ..LoopConfig::default()
            },
        );
        assert_eq!(bl.iteration_spacing_ms(30), MIN_SPACING_MS);
    }

    #[test]
    fn direct_sht40_end_to_end() {
        init_logging();
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_sht40(PATH, 0x44, 32768, 32768);
        let manager = Arc::new(BusManager::with_transport(mock));
        let bl = BusLoop::new(PATH, manager.clone(), test_config());
        bl.expect(&[DriverKind::Sht40]);
        bl.start();

        let state = wait_for(Duration::from_secs(5), || {
            bl.get_sensor_state("/dev/i2c-0:*:0x44")
        })
        .expect("no SHT40 snapshot appeared");

        assert!(state.connected);
        assert!(state.error_message.is_none());
        match state.data {
            SensorData::Climate {
                temperature_c,
                humidity_rh,
            } => {
                assert!((temperature_c - 42.5).abs() < 0.01);
                assert!((humidity_rh - 56.5).abs() < 0.01);
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        bl.cancel();
        assert!(!bl.is_running());
        // Shutdown force-closes the bus.
        assert!(manager.current_handle(PATH).is_none());
    }

    #[test]
    fn as7343_behind_multiplexer_end_to_end() {
        init_logging();
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_mux(PATH, 0x70);
        mock.add_as7343_behind(PATH, 0x70, 2, 0x39);
        let mut data = [0u16; 18];
        for (i, value) in data.iter_mut().enumerate() {
            *value = i as u16;
        }
        mock.set_as7343_data(PATH, 0x39, data);

        let manager = Arc::new(BusManager::with_transport(mock));
        let bl = BusLoop::new(PATH, manager, test_config());
        bl.expect(&[DriverKind::As7343]);
        bl.start();

        let state = wait_for(Duration::from_secs(5), || {
            bl.get_sensor_state("/dev/i2c-0:2:0x39")
        })
        .expect("no AS7343 snapshot appeared");

        match &state.data {
            SensorData::Color(channels) => {
                let expect = [
                    ("F1", 12),
                    ("F2", 6),
                    ("F3", 7),
                    ("F4", 8),
                    ("F5", 15),
                    ("F6", 9),
                    ("F7", 13),
                    ("F8", 14),
                    ("FZ", 0),
                    ("FY", 1),
                    ("FXL", 2),
                    ("NIR", 3),
                    ("VIS", 16),
                    ("FD", 17),
                ];
                for (label, value) in expect {
                    assert_eq!(channels[label], value, "channel {}", label);
                }
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        // The switch publishes its own snapshot.
        assert!(bl.get_sensor_state("/dev/i2c-0:*:0x70").is_some());
        bl.cancel();
    }

    #[test]
    fn rescan_discovers_late_sensor() {
        init_logging();
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_sht40(PATH, 0x44, 32768, 32768);
        let manager = Arc::new(BusManager::with_transport(mock.clone()));
        let bl = BusLoop::new(PATH, manager, test_config());
        bl.expect(&[DriverKind::Sht40, DriverKind::As7343]);
        bl.start();

        wait_for(Duration::from_secs(5), || {
            bl.get_sensor_state("/dev/i2c-0:*:0x44")
        })
        .expect("no SHT40 snapshot appeared");
        assert!(bl.get_sensor_state("/dev/i2c-0:*:0x39").is_none());

        // The device shows up late; a rescan must pick it up.
        mock.add_as7343(PATH, 0x39);
        let state = wait_for(Duration::from_secs(5), || {
            bl.get_sensor_state("/dev/i2c-0:*:0x39")
        });
        assert!(state.is_some(), "late sensor was not discovered");
        bl.cancel();
    }

    #[test]
    fn stale_snapshots_are_evicted() {
        init_logging();
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_sht40(PATH, 0x44, 32768, 32768);
        let manager = Arc::new(BusManager::with_transport(mock));
        let mut config = test_config();
        // The SHT40 reads once (10 s minimum interval) and then its
        // snapshot ages out.
        config.stale_state_timeout_ms = Some(300);
        config.rescan_interval_ms = 60_000;
        let bl = BusLoop::new(PATH, manager, config);
        bl.start();

        wait_for(Duration::from_secs(5), || {
            bl.get_sensor_state("/dev/i2c-0:*:0x44")
        })
        .expect("no SHT40 snapshot appeared");

        let gone = wait_for(Duration::from_secs(5), || {
            if bl.get_sensor_state("/dev/i2c-0:*:0x44").is_none() {
                Some(())
            } else {
                None
            }
        });
        assert!(gone.is_some(), "stale snapshot was never evicted");
        bl.cancel();
    }

    #[test]
    fn start_and_cancel_are_idempotent() {
        init_logging();
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        let manager = Arc::new(BusManager::with_transport(mock));
        let bl = BusLoop::new(PATH, manager, test_config());
        bl.start();
        bl.start();
        assert!(bl.is_running());
        bl.cancel();
        bl.cancel();
        assert!(!bl.is_running());
    }
}
