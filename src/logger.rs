//! Structured per-tick telemetry: a bounded queue drained by a background
//! worker that batches records into newline-delimited JSON.

use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

const QUEUE_CAPACITY: usize = 1024;
const IDLE_POLL: Duration = Duration::from_millis(200);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Segment durations for one tick, in microseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickTimings {
    pub joints_read_us: u64,
    pub imu_read_us: u64,
    pub command_read_us: u64,
    pub policy_step_us: u64,
    pub action_apply_us: u64,
    pub bus_flush_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: f64,
    pub tick: u64,
    pub timings: TickTimings,
    pub joint_angles: Vec<f64>,
    pub joint_velocities: Vec<f64>,
    pub joint_torques: Vec<f64>,
    pub joint_temperatures: Vec<f64>,
    pub projected_gravity: [f64; 3],
    pub gyroscope: [f64; 3],
    pub command_vector: Vec<f64>,
    pub action_vector: Vec<f64>,
}

/// Handle to the background NDJSON writer. Cloning shares the same queue.
#[derive(Clone)]
pub struct Logger {
    sender: mpsc::Sender<LogRecord>,
}

impl Logger {
    /// Spawns the background worker writing to `path`. The parent directory
    /// is created if missing.
    pub fn spawn(path: impl AsRef<Path>) -> crate::error::Result<(Self, tokio::task::JoinHandle<()>)> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;

        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(Self::worker(receiver, file));
        Ok((Logger { sender }, handle))
    }

    /// Enqueues a record. Never blocks the control loop: if the queue is
    /// full the record is dropped and a warning logged.
    pub fn log(&self, record: LogRecord) {
        if self.sender.try_send(record).is_err() {
            warn!("telemetry queue full, dropping tick record");
        }
    }

    /// Closes the queue and waits (bounded) for the worker to drain it.
    pub async fn shutdown(self, handle: tokio::task::JoinHandle<()>) {
        drop(self.sender);
        if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("logger drain timed out");
        }
    }

    async fn worker(mut receiver: mpsc::Receiver<LogRecord>, mut file: std::fs::File) {
        let mut batch = Vec::new();
        loop {
            match tokio::time::timeout(IDLE_POLL, receiver.recv()).await {
                Ok(Some(record)) => {
                    batch.push(record);
                    while let Ok(record) = receiver.try_recv() {
                        batch.push(record);
                    }
                    Self::flush_batch(&mut file, &mut batch);
                }
                Ok(None) => {
                    Self::flush_batch(&mut file, &mut batch);
                    break;
                }
                Err(_) => {
                    if !batch.is_empty() {
                        Self::flush_batch(&mut file, &mut batch);
                    }
                }
            }
        }
    }

    fn flush_batch(file: &mut std::fs::File, batch: &mut Vec<LogRecord>) {
        if batch.is_empty() {
            return;
        }
        let mut buf = String::new();
        for record in batch.drain(..) {
            match serde_json::to_string(&record) {
                Ok(line) => {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(e) => error!(error = %e, "failed to serialize log record"),
            }
        }
        if let Err(e) = file.write_all(buf.as_bytes()) {
            error!(error = %e, "failed to write telemetry batch");
            return;
        }
        if let Err(e) = file.flush() {
            error!(error = %e, "failed to flush telemetry file");
        }
    }
}

/// `~/kinfer-logs/<policy>_<timestamp>/kinfer_log.ndjson`
pub fn default_log_path(policy_name: &str, unix_timestamp: u64) -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join("kinfer-logs")
        .join(format!("{policy_name}_{unix_timestamp}"))
        .join("kinfer_log.ndjson")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_round_trip_through_the_queue_to_disk() {
        let dir = std::env::temp_dir().join(format!("kinfer-logger-test-{}", std::process::id()));
        let path = dir.join("kinfer_log.ndjson");
        let (logger, handle) = Logger::spawn(&path).unwrap();

        logger.log(LogRecord {
            timestamp: 1.0,
            tick: 0,
            timings: TickTimings::default(),
            joint_angles: vec![0.0, 1.0],
            joint_velocities: vec![0.0, 0.0],
            joint_torques: vec![0.0, 0.0],
            joint_temperatures: vec![20.0, 20.0],
            projected_gravity: [0.0, 0.0, -9.81],
            gyroscope: [0.0, 0.0, 0.0],
            command_vector: vec![0.0],
            action_vector: vec![0.0, 1.0],
        });

        logger.shutdown(handle).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"tick\":0"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn default_log_path_embeds_policy_name_and_timestamp() {
        let path = default_log_path("sine_wave", 1234);
        assert!(path.to_string_lossy().contains("sine_wave_1234"));
        assert!(path.ends_with("kinfer_log.ndjson"));
    }
}
