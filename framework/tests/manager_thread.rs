//! Sensor manager running on its own thread, consumed by a bay

use std::thread;
use std::time::{Duration, Instant};

use baydock::{
    Bay, BayState, Occupancy, RangeQuality, SensorFeed, SensorManager, SensorState, SimBoard,
    SystemConfig,
};
use serde_json::json;

fn config() -> SystemConfig {
    serde_json::from_value(json!({
        "scan_interval_ms": 2,
        "i2c": { "bus": 1, "enable_pin": 17, "ready_pin": 27, "ready_timeout_secs": 0.5 },
        "sensors": [
            { "name": "range", "hw_type": "SerialTOF", "port": "/dev/ttyAMA0" },
            { "name": "rear", "hw_type": "I2CTOF", "address": 48, "enable_pin": 5, "settle_ms": 0 },
            { "name": "middle", "hw_type": "I2CTOF", "address": 49, "enable_pin": 6, "settle_ms": 0 },
            { "name": "front", "hw_type": "I2CTOF", "address": 50, "enable_board": 88,
              "enable_pin": 0, "settle_ms": 0 }
        ],
        "bays": [{
            "id": "bay1",
            "depth": 500,
            "timeouts": { "dock": 30, "undock": 30 },
            "longitudinal": {
                "defaults": { "spread_park": 5, "pct_warn": 70, "pct_crit": 30 },
                "sensors": [{ "name": "range", "offset": 50 }]
            },
            "lateral": {
                "defaults": { "spread_ok": 5, "spread_warn": 10, "side": "R", "offset": 30 },
                "sensors": [
                    { "name": "front", "intercept": 300 },
                    { "name": "rear", "intercept": 100 },
                    { "name": "middle", "intercept": 200 }
                ]
            }
        }]
    }))
    .unwrap()
}

/// Pump the feed into the bay until `done` holds or two seconds pass
fn run_until(feed: &mut SensorFeed, bay: &mut Bay, done: impl Fn(&Bay) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Some(response) = feed.poll() {
            bay.update(response);
        }
        bay.check_timer();
        if done(bay) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_vehicle_docks_into_bay() {
    let config = config();
    let board = SimBoard::from_config(&config, 480);
    let mut platform = board.platform;
    let (manager, link) = SensorManager::new(&config, &mut platform).unwrap();

    let sensors = manager.enumerate_sensors();
    assert_eq!(sensors.len(), 4);
    assert!(sensors.iter().all(|s| s.failure.is_none()));
    assert_eq!(sensors[1].state, SensorState::Enabled);

    let handle = manager.spawn().unwrap();
    let mut bay = Bay::new(&config.bays[0], link.control.clone()).unwrap();
    let mut feed = SensorFeed::new(link.responses);

    // Door open, nothing inside
    assert!(run_until(&mut feed, &mut bay, |b| b.occupied() == Occupancy::Vacant));
    assert_eq!(bay.range_quality(), RangeQuality::NoObject);

    bay.dock().unwrap();
    assert!(run_until(&mut feed, &mut bay, |b| b
        .laterals()
        .iter()
        .all(|l| l.is_ranging())));

    for distance in [400u16, 300, 200, 120] {
        for tof in board.tofs.values() {
            tof.set_distance_mm(Some(distance * 10));
        }
        for serial in board.serial.values() {
            serial.set_distance(distance);
        }
        assert!(run_until(&mut feed, &mut bay, |b| b
            .range()
            .raw()
            .map_or(false, |raw| raw.cm() == f64::from(distance))));
    }

    board.tofs["rear"].set_distance_mm(Some(330));
    board.tofs["middle"].set_distance_mm(Some(380));
    board.tofs["front"].set_distance_mm(Some(4000));
    board.serial["range"].set_distance(52);

    assert!(run_until(&mut feed, &mut bay, |b| {
        b.range_quality() == RangeQuality::Park && b.occupied() == Occupancy::Occupied
    }));
    assert_eq!(bay.state(), BayState::Docking);
    assert!(bay.vector().is_some());

    bay.abort().unwrap();
    bay.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_handle_drop_stops_manager() {
    let config = config();
    let mut board = SimBoard::from_config(&config, 200);
    let (manager, link) = SensorManager::new(&config, &mut board.platform).unwrap();
    let handle = manager.spawn().unwrap();

    let first = link
        .responses
        .recv_timeout(Duration::from_secs(2))
        .unwrap();
    assert_eq!(first.readings.len(), 4);
    assert!(handle.is_running());

    drop(handle);
    // Manager thread gone: the channel disconnects once drained
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut disconnected = false;
    while Instant::now() < deadline {
        if let Err(crossbeam::channel::TryRecvError::Disconnected) = link.responses.try_recv() {
            disconnected = true;
            break;
        }
    }
    assert!(disconnected);
}
