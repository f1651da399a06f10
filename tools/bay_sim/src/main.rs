//! Simulated Parking Bay
//!
//! Runs a full sensor pool on simulated hardware through the sensor
//! manager thread and one bay state machine: a vehicle drives in, parks,
//! sits until the dock timeout expires, then backs out.
//!
//! Run with: RUST_LOG=info cargo run -p bay-sim -- [config.json]

use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use baydock::{Bay, BayState, SensorFeed, SensorManager, SimBoard, SystemConfig};
use log::{info, warn};

/// Bay used when no configuration file is given
const DEFAULT_CONFIG: &str = r#"{
    "scan_interval_ms": 20,
    "i2c": { "bus": 1, "enable_pin": 17, "ready_pin": 27, "ready_timeout_secs": 1.0 },
    "sensors": [
        { "name": "range", "hw_type": "SerialTOF", "port": "/dev/ttyAMA0", "clustering": 2 },
        { "name": "rear", "hw_type": "I2CTOF", "address": 48, "enable_pin": 5 },
        { "name": "middle", "hw_type": "I2CTOF", "address": 49, "enable_pin": 6 },
        { "name": "front", "hw_type": "I2CTOF", "address": 50, "enable_board": 88, "enable_pin": 0 }
    ],
    "bays": [{
        "id": "bay1",
        "name": "Garage",
        "depth": 500,
        "timeouts": { "dock": 2, "undock": 2 },
        "longitudinal": {
            "defaults": { "spread_park": 5, "pct_warn": 70, "pct_crit": 30 },
            "sensors": [{ "name": "range", "offset": 50 }]
        },
        "lateral": {
            "defaults": { "spread_ok": 5, "spread_warn": 10, "side": "R", "offset": 30 },
            "sensors": [
                { "name": "front", "intercept": 300 },
                { "name": "middle", "intercept": 200 },
                { "name": "rear", "intercept": 100 }
            ]
        }
    }]
}"#;

/// Range distance (cm) per step while the vehicle drives in
const APPROACH: [u16; 10] = [480, 440, 390, 330, 270, 210, 160, 110, 75, 52];
/// Lateral distance (cm) once the flank passes a sensor
const FLANK_CM: u16 = 33;
const STEP: Duration = Duration::from_millis(400);

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config: SystemConfig = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
        None => serde_json::from_str(DEFAULT_CONFIG)?,
    };
    let bay_config = config.bays.first().ok_or("configuration has no bays")?;

    println!();
    println!("============================================================");
    println!("         Simulated Parking Bay: {}", bay_config.display_name());
    println!("============================================================");
    println!();

    let mut board = SimBoard::from_config(&config, APPROACH[0]);
    let (manager, link) = SensorManager::new(&config, &mut board.platform)?;
    for sensor in manager.enumerate_sensors() {
        println!(
            "  {:<8} {:<24} {}",
            sensor.name,
            sensor.interface.as_deref().unwrap_or("-"),
            sensor.failure.as_deref().unwrap_or("ok")
        );
    }
    println!();

    let handle = manager.spawn()?;
    let mut bay = Bay::new(bay_config, link.control.clone())?;
    let mut feed = SensorFeed::new(link.responses);

    println!("Phase 1: DOCKING");
    bay.dock()?;
    for &distance in &APPROACH {
        place_vehicle(&board, &bay, distance);
        run_for(&mut feed, &mut bay, STEP);
        report(&bay);
    }

    println!();
    println!("Phase 2: PARKED, waiting for dock timeout");
    let parked_at = Instant::now();
    while bay.state() == BayState::Docking && parked_at.elapsed() < Duration::from_secs(10) {
        run_for(&mut feed, &mut bay, STEP);
    }
    report(&bay);

    println!();
    println!("Phase 3: UNDOCKING");
    bay.undock()?;
    for &distance in APPROACH.iter().rev() {
        place_vehicle(&board, &bay, distance);
        run_for(&mut feed, &mut bay, STEP);
        report(&bay);
    }
    bay.abort()?;

    bay.shutdown();
    run_for(&mut feed, &mut bay, STEP);
    if handle.join().is_err() {
        warn!("sensor manager thread panicked");
    }
    println!();
    println!("Done.");
    Ok(())
}

/// Move the simulated vehicle so its nose is `distance` cm from the range sensor
fn place_vehicle(board: &SimBoard, bay: &Bay, distance: u16) {
    if let Some(serial) = board.serial.get(bay.range().id()) {
        serial.set_distance(distance);
    }
    for (id, intercept) in bay.lateral_order() {
        let flank = if f64::from(distance) <= intercept.cm() {
            FLANK_CM
        } else {
            // Sees the far wall until the vehicle arrives
            400
        };
        if let Some(tof) = board.tofs.get(id) {
            tof.set_distance_mm(Some(flank * 10));
        }
    }
}

/// Pump sensor data into the bay for `period`
fn run_for(feed: &mut SensorFeed, bay: &mut Bay, period: Duration) {
    let end = Instant::now() + period;
    while Instant::now() < end {
        if let Some(response) = feed.poll() {
            bay.update(response);
        }
        bay.check_timer();
        thread::sleep(Duration::from_millis(10));
    }
}

fn report(bay: &Bay) {
    let raw = bay
        .range()
        .raw()
        .map_or_else(|| "--".to_string(), |d| d.to_string());
    let vector = bay
        .vector()
        .map_or_else(|| "--".to_string(), |v| format!("{:?} {}", v.direction, v.speed));
    let laterals: Vec<String> = bay
        .lateral_qualities()
        .into_iter()
        .map(|(id, q)| format!("{}={:?}", id, q))
        .collect();
    info!(
        "[{}] {} range {} {:?} ({:.0}%) {} | {} | {} | timer {:.1}s",
        bay.id(),
        bay.state(),
        raw,
        bay.range_quality(),
        bay.range_pct() * 100.0,
        vector,
        laterals.join(" "),
        bay.occupied(),
        bay.motion_timer().as_secs_f64()
    );
}
