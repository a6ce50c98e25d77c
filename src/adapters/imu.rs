//! IMU adapter: any source exposing projected gravity, gyroscope, and a
//! sample timestamp. The control loop is agnostic to how a concrete
//! implementation acquires these; it only reads the latest snapshot.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// One IMU sample: gravity in the body frame, angular rate, and the time
/// the sample was taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImuSample {
    pub projected_gravity: [f64; 3],
    pub gyroscope: [f64; 3],
    pub timestamp: f64,
}

/// A source of IMU samples. Implementations must not block the caller for
/// longer than a snapshot read.
pub trait Imu: Send + Sync {
    fn read(&self) -> ImuSample;
}

/// Returns fixed zero gravity-frame readings. Used when no physical IMU is
/// attached (bench testing, simulation, CI).
pub struct DummyImu;

impl Imu for DummyImu {
    fn read(&self) -> ImuSample {
        ImuSample {
            projected_gravity: [0.0, 0.0, -9.81],
            gyroscope: [0.0, 0.0, 0.0],
            timestamp: now(),
        }
    }
}

fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// A quaternion-rotated shared-memory IMU: a background task publishes the
/// latest sample into a `Mutex`-guarded record (the thread analogue of the
/// mmap-backed child process variant); the loop reads a copy under the lock
/// and releases immediately.
pub struct SharedMemoryImu {
    latest: Arc<Mutex<ImuSample>>,
}

impl SharedMemoryImu {
    pub fn new() -> (Self, ImuPublisher) {
        let latest = Arc::new(Mutex::new(ImuSample::default()));
        (SharedMemoryImu { latest: latest.clone() }, ImuPublisher { latest })
    }
}

impl Imu for SharedMemoryImu {
    fn read(&self) -> ImuSample {
        *self.latest.lock().unwrap()
    }
}

/// The write side of a [`SharedMemoryImu`]: held by whatever background task
/// samples the physical sensor.
#[derive(Clone)]
pub struct ImuPublisher {
    latest: Arc<Mutex<ImuSample>>,
}

impl ImuPublisher {
    pub fn publish(&self, sample: ImuSample) {
        *self.latest.lock().unwrap() = sample;
    }

    /// Publishes gyro and world-frame gravity rotated into the body frame by
    /// the inverse of the current orientation quaternion `(w, x, y, z)`.
    pub fn publish_from_orientation(&self, gyro: [f64; 3], quaternion: [f64; 4], timestamp: f64) {
        const WORLD_GRAVITY: [f64; 3] = [0.0, 0.0, -9.81];
        let projected_gravity = rotate_by_quaternion_inverse(WORLD_GRAVITY, quaternion);
        self.publish(ImuSample { projected_gravity, gyroscope: gyro, timestamp });
    }
}

fn quaternion_conjugate(q: [f64; 4]) -> [f64; 4] {
    [q[0], -q[1], -q[2], -q[3]]
}

fn quaternion_multiply(a: [f64; 4], b: [f64; 4]) -> [f64; 4] {
    let (w1, x1, y1, z1) = (a[0], a[1], a[2], a[3]);
    let (w2, x2, y2, z2) = (b[0], b[1], b[2], b[3]);
    [
        w1 * w2 - x1 * x2 - y1 * y2 - z1 * z2,
        w1 * x2 + x1 * w2 + y1 * z2 - z1 * y2,
        w1 * y2 - x1 * z2 + y1 * w2 + z1 * x2,
        w1 * z2 + x1 * y2 - y1 * x2 + z1 * w2,
    ]
}

/// Rotates `v` by the conjugate (inverse) of `q`: world frame -> body frame.
fn rotate_by_quaternion_inverse(v: [f64; 3], q: [f64; 4]) -> [f64; 3] {
    let v_quat = [0.0, v[0], v[1], v[2]];
    let q_conj = quaternion_conjugate(q);
    let rotated = quaternion_multiply(quaternion_multiply(q_conj, v_quat), q);
    [rotated[1], rotated[2], rotated[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_imu_reports_standard_gravity_at_rest() {
        let sample = DummyImu.read();
        assert_eq!(sample.projected_gravity, [0.0, 0.0, -9.81]);
        assert_eq!(sample.gyroscope, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn identity_orientation_leaves_gravity_unrotated() {
        let rotated = rotate_by_quaternion_inverse([0.0, 0.0, -9.81], [1.0, 0.0, 0.0, 0.0]);
        assert!((rotated[2] + 9.81).abs() < 1e-9);
    }

    #[test]
    fn shared_memory_imu_reads_the_latest_publish() {
        let (imu, publisher) = SharedMemoryImu::new();
        publisher.publish(ImuSample { projected_gravity: [1.0, 2.0, 3.0], gyroscope: [0.1, 0.2, 0.3], timestamp: 5.0 });
        let sample = imu.read();
        assert_eq!(sample.projected_gravity, [1.0, 2.0, 3.0]);
        assert_eq!(sample.timestamp, 5.0);
    }
}
