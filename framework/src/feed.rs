//! Consumer side of the sensor manager's output channel
//!
//! The control loop never blocks on sensor data: each `poll` takes whatever
//! the manager has published since the last call and otherwise hands back
//! the most recent response again.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crossbeam::channel::{Receiver, TryRecvError};
use log::{debug, warn};

use crate::reading::{Reading, SensorId, SensorResponse, SensorStatus};

/// Responses kept for diagnostics
const LOG_LEN: usize = 100;

pub struct SensorFeed {
    responses: Receiver<SensorResponse>,
    last_timestamp: Option<Instant>,
    fresh: bool,
    log: VecDeque<SensorResponse>,
    /// Last meaningful reading per sensor
    latest: HashMap<SensorId, Reading>,
    disconnected: bool,
}

impl SensorFeed {
    pub fn new(responses: Receiver<SensorResponse>) -> Self {
        Self {
            responses,
            last_timestamp: None,
            fresh: false,
            log: VecDeque::with_capacity(LOG_LEN),
            latest: HashMap::new(),
            disconnected: false,
        }
    }

    /// Take a newly published response, if any, and return the most recent one
    ///
    /// `None` until the manager has published at least once.
    pub fn poll(&mut self) -> Option<&SensorResponse> {
        self.fresh = false;
        match self.responses.try_recv() {
            Ok(response) => self.accept(response),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                if !self.disconnected {
                    warn!("sensor manager output closed");
                    self.disconnected = true;
                }
            }
        }
        self.log.back()
    }

    fn accept(&mut self, response: SensorResponse) {
        if self.last_timestamp == Some(response.timestamp) {
            debug!("duplicate response ignored");
            return;
        }
        for (id, reading) in &response.readings {
            // No new measurement; the previous one still stands
            if reading.status == SensorStatus::InterruptNotReady && self.latest.contains_key(id) {
                continue;
            }
            self.latest.insert(id.clone(), reading.clone());
        }
        self.last_timestamp = Some(response.timestamp);
        if self.log.len() == LOG_LEN {
            self.log.pop_front();
        }
        self.log.push_back(response);
        self.fresh = true;
    }

    /// Whether the last `poll` received a new response
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Whether the manager has gone away
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn current(&self) -> Option<&SensorResponse> {
        self.log.back()
    }

    /// Latest meaningful reading for `sensor`
    pub fn reading(&self, sensor: &str) -> Option<&Reading> {
        self.latest.get(sensor)
    }

    pub fn latest(&self) -> &HashMap<SensorId, Reading> {
        &self.latest
    }

    /// Received responses, oldest first
    pub fn log(&self) -> impl Iterator<Item = &SensorResponse> {
        self.log.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Length;
    use crossbeam::channel::bounded;
    use std::time::Duration;

    fn response(at: Instant, readings: Vec<(&str, Reading)>) -> SensorResponse {
        SensorResponse {
            timestamp: at,
            readings: readings
                .into_iter()
                .map(|(id, r)| (id.to_string(), r.at(at)))
                .collect(),
            scan_duration: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_returns_latest_when_empty() {
        let (tx, rx) = bounded(1);
        let mut feed = SensorFeed::new(rx);
        assert!(feed.poll().is_none());

        let t0 = Instant::now();
        tx.send(response(t0, vec![("range", Reading::range(Length::from_cm(100.0), None))]))
            .unwrap();
        assert_eq!(feed.poll().unwrap().timestamp, t0);
        assert!(feed.is_fresh());

        // Nothing new: same response again, not fresh
        assert_eq!(feed.poll().unwrap().timestamp, t0);
        assert!(!feed.is_fresh());
        assert_eq!(feed.log().count(), 1);
    }

    #[test]
    fn test_duplicate_timestamp_ignored() {
        let (tx, rx) = bounded(1);
        let mut feed = SensorFeed::new(rx);
        let t0 = Instant::now();
        tx.send(response(t0, vec![])).unwrap();
        feed.poll();
        tx.send(response(t0, vec![])).unwrap();
        feed.poll();
        assert!(!feed.is_fresh());
        assert_eq!(feed.log().count(), 1);
    }

    #[test]
    fn test_interrupt_not_ready_keeps_previous_reading() {
        let (tx, rx) = bounded(1);
        let mut feed = SensorFeed::new(rx);
        let t0 = Instant::now();
        tx.send(response(
            t0,
            vec![
                ("left", Reading::range(Length::from_cm(40.0), None)),
                ("right", Reading::status(SensorStatus::InterruptNotReady)),
            ],
        ))
        .unwrap();
        feed.poll();

        let t1 = t0 + Duration::from_millis(50);
        tx.send(response(
            t1,
            vec![
                ("left", Reading::status(SensorStatus::InterruptNotReady)),
                ("right", Reading::range(Length::from_cm(35.0), None)),
            ],
        ))
        .unwrap();
        feed.poll();

        let left = feed.reading("left").unwrap();
        assert_eq!(left.distance, Some(Length::from_cm(40.0)));
        assert_eq!(left.timestamp, t0);
        assert_eq!(feed.reading("right").unwrap().distance, Some(Length::from_cm(35.0)));
        assert_eq!(feed.latest().len(), 2);
    }

    #[test]
    fn test_log_is_bounded() {
        let (tx, rx) = bounded(1);
        let mut feed = SensorFeed::new(rx);
        let start = Instant::now();
        for i in 0..(LOG_LEN as u64 + 5) {
            tx.send(response(start + Duration::from_millis(i), vec![])).unwrap();
            feed.poll();
        }
        assert_eq!(feed.log().count(), LOG_LEN);
        assert_eq!(
            feed.log().next().unwrap().timestamp,
            start + Duration::from_millis(5)
        );
    }

    #[test]
    fn test_disconnect_reported() {
        let (tx, rx) = bounded::<SensorResponse>(1);
        let mut feed = SensorFeed::new(rx);
        drop(tx);
        assert!(feed.poll().is_none());
        assert!(feed.is_disconnected());
    }
}
