//! Motor Driver: aggregates one [`BusInterface`] per discovered CAN bus,
//! fans commands out across them, and merges feedback into one physical-unit
//! joint-state map.

use crate::can::bus::BusInterface;
use crate::can::wire::RawFeedback;
use crate::catalog::{ActuatorFamily, Field, RobotConfig};
use crate::error::{FirmwareError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

const STARTUP_ANGLE_LIMIT_RAD: f64 = 2.0;
const RAMP_STEPS: usize = 30;
const RAMP_STEP_HOLD: Duration = Duration::from_millis(100);
const FEEDBACK_TRANCHE_TIMEOUT: Duration = Duration::from_millis(100);

/// One joint's feedback, converted to physical units.
#[derive(Debug, Clone, Copy, Default)]
pub struct JointSample {
    pub angle: f64,
    pub velocity: f64,
    pub torque: f64,
    pub temperature: f64,
}

fn to_sample(family: ActuatorFamily, raw: RawFeedback) -> JointSample {
    JointSample {
        angle: family.wire_to_physical(Field::Angle, raw.angle_raw),
        velocity: family.wire_to_physical(Field::Velocity, raw.velocity_raw),
        torque: family.wire_to_physical(Field::Torque, raw.torque_raw),
        temperature: crate::catalog::wire_to_temperature(raw.temperature_raw),
    }
}

pub struct MotorDriver {
    buses: Vec<BusInterface>,
    robot: RobotConfig,
    max_scaling: f64,
    last_scaling: f64,
    motors_enabled: bool,
}

impl MotorDriver {
    /// Binds and discovers every named interface; drops any bus with no
    /// responding actuators. Fails if none remain.
    pub async fn discover(interface_names: &[String], robot: RobotConfig, max_scaling: f64) -> Result<Self> {
        let mut buses = Vec::new();
        for name in interface_names {
            match BusInterface::bind(name) {
                Ok(mut bus) => match bus.discover().await {
                    Ok(()) if !bus.discovered().is_empty() => {
                        info!(interface = name.as_str(), found = bus.discovered().len(), "bus discovered");
                        buses.push(bus);
                    }
                    Ok(()) => {
                        warn!(interface = name.as_str(), "no actuators responded, dropping bus");
                    }
                    Err(e) => warn!(interface = name.as_str(), error = %e, "discovery failed"),
                },
                Err(e) => warn!(interface = name.as_str(), error = %e, "bus absent"),
            }
        }

        if buses.is_empty() {
            return Err(FirmwareError::StartupInvariantViolated(
                "no CAN buses discovered".into(),
            ));
        }

        Ok(MotorDriver { buses, robot, max_scaling, last_scaling: 0.0, motors_enabled: false })
    }

    pub fn robot(&self) -> &RobotConfig {
        &self.robot
    }

    /// Confirms the robot is near its home pose before motors are enabled.
    pub async fn startup_sequence(&mut self) -> Result<HashMap<u8, JointSample>> {
        let samples = self.get_joint_angles_and_velocities().await?;
        for (id, sample) in &samples {
            if sample.angle.abs() > STARTUP_ANGLE_LIMIT_RAD {
                return Err(FirmwareError::StartupInvariantViolated(format!(
                    "actuator {id} angle {:.3} rad exceeds {STARTUP_ANGLE_LIMIT_RAD} rad safety limit",
                    sample.angle
                )));
            }
        }
        Ok(samples)
    }

    pub async fn enable_and_home(&mut self, home_positions: &HashMap<u8, f64>) -> Result<()> {
        let enable_futs = self.buses.iter().map(|bus| bus.enable_all());
        for result in futures::future::join_all(enable_futs).await {
            result?;
        }
        self.motors_enabled = true;
        info!("all motors enabled");

        for i in 0..RAMP_STEPS {
            let scale = log_ramp_step(i) * self.max_scaling;
            info!(step = i, scale, "pd ramp");
            self.set_pd_targets(home_positions, scale).await?;
            tokio::time::sleep(RAMP_STEP_HOLD).await;
        }
        info!("homing complete");
        Ok(())
    }

    /// Tranche-ordered cross-bus feedback exchange: for each rank `i`, send a
    /// request to the i-th actuator on every bus that has one, then read one
    /// response from each of those buses, before moving to rank `i+1`.
    pub async fn get_joint_angles_and_velocities(&mut self) -> Result<HashMap<u8, JointSample>> {
        let max_len = self.buses.iter().map(|b| b.discovered().len()).max().unwrap_or(0);
        let mut fresh: HashMap<u8, RawFeedback> = HashMap::new();

        for i in 0..max_len {
            let ranks: Vec<Option<u8>> = self.buses.iter().map(|b| b.discovered().get(i).copied()).collect();

            let send_futs = self.buses.iter().zip(ranks.iter()).filter_map(|(bus, id)| {
                id.map(|id| bus.send_feedback_request(id))
            });
            for result in futures::future::join_all(send_futs).await {
                if let Err(e) = result {
                    warn!(error = %e, "feedback request send failed");
                }
            }

            let recv_futs = self.buses.iter_mut().zip(ranks.iter()).filter_map(|(bus, id)| {
                id.map(|_| bus.recv_feedback_response(FEEDBACK_TRANCHE_TIMEOUT))
            });
            for result in futures::future::join_all(recv_futs).await {
                match result {
                    Ok(Some((actuator_id, raw))) => {
                        fresh.insert(actuator_id, raw);
                    }
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let mut out = HashMap::new();
        for bus in &self.buses {
            for &id in bus.discovered() {
                let Some(descriptor) = self.robot.descriptor(id) else { continue };
                let raw = fresh.get(&id).copied().or_else(|| bus.last_known(id).copied());
                let sample = raw.map(|r| to_sample(descriptor.family, r)).unwrap_or_default();
                out.insert(id, sample);
            }
        }
        Ok(out)
    }

    /// Projects the merged joint-state map into the caller-supplied vector
    /// ordering (the ordering the policy consumes).
    pub async fn get_ordered_joint_data(
        &mut self,
        joint_order: &[String],
    ) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>)> {
        let samples = self.get_joint_angles_and_velocities().await?;
        let mut angles = Vec::with_capacity(joint_order.len());
        let mut velocities = Vec::with_capacity(joint_order.len());
        let mut torques = Vec::with_capacity(joint_order.len());
        let mut temperatures = Vec::with_capacity(joint_order.len());

        for name in joint_order {
            let id = self
                .robot
                .id_for_name(name)
                .ok_or_else(|| FirmwareError::Protocol(format!("unknown joint name {name}")))?;
            let sample = samples.get(&id).copied().unwrap_or_default();
            angles.push(sample.angle);
            velocities.push(sample.velocity);
            torques.push(sample.torque);
            temperatures.push(sample.temperature);
        }
        Ok((angles, velocities, torques, temperatures))
    }

    /// Sends one PD frame per commanded identifier that lives on this
    /// driver's buses, at the given gain scale in `[0, 1]`.
    pub async fn set_pd_targets(&mut self, targets: &HashMap<u8, f64>, scaling: f64) -> Result<()> {
        self.last_scaling = scaling;

        let robot = &self.robot;
        let mut bus_futs = Vec::new();
        for bus in self.buses.iter_mut() {
            let mut plan = Vec::new();
            for id in bus.discovered().to_vec() {
                let Some(angle) = targets.get(&id).copied() else { continue };
                let Some(descriptor) = robot.descriptor(id) else { continue };
                let family = descriptor.family;
                let raw_angle = family.physical_to_wire(Field::Angle, angle);
                let raw_velocity = family.physical_to_wire(Field::Velocity, 0.0);
                let raw_torque = family.physical_to_wire(Field::Torque, 0.0);
                let raw_kp = family.physical_to_wire(Field::Kp, descriptor.kp * scaling);
                let raw_kd = family.physical_to_wire(Field::Kd, descriptor.kd * scaling);
                plan.push((id, raw_torque, raw_angle, raw_velocity, raw_kp, raw_kd));
            }
            // Sends within one bus are serialised: the socket is shared.
            bus_futs.push(async move {
                for (id, raw_torque, raw_angle, raw_velocity, raw_kp, raw_kd) in plan {
                    bus.send_pd_and_await(id, raw_torque, raw_angle, raw_velocity, raw_kp, raw_kd).await?;
                }
                Ok::<(), FirmwareError>(())
            });
        }
        for result in futures::future::join_all(bus_futs).await {
            result?;
        }
        Ok(())
    }

    /// Drains any stray frames from every bus. Returns the total drained.
    pub fn flush_can_buses(&self) -> Result<usize> {
        let mut total = 0;
        for bus in &self.buses {
            total += bus.flush()?;
        }
        Ok(total)
    }

    /// Inverse of [`enable_and_home`](Self::enable_and_home): ramps from the
    /// last-issued scale down to zero using the *current* angles as targets,
    /// then disables every motor.
    pub async fn ramp_down(&mut self) -> Result<()> {
        if !self.motors_enabled {
            return Ok(());
        }

        self.flush_can_buses()?;
        let samples = self.get_joint_angles_and_velocities().await?;
        if samples.is_empty() {
            warn!("no actuators responding, skipping ramp down");
            self.motors_enabled = false;
            return Ok(());
        }

        let current_angles: HashMap<u8, f64> = samples.iter().map(|(&id, s)| (id, s.angle)).collect();
        let start_scale = self.last_scaling;

        for i in 0..RAMP_STEPS {
            let progress = i as f64 / (RAMP_STEPS - 1) as f64;
            let scale = start_scale * ((0.001_f64.ln() + (1.0_f64.ln() - 0.001_f64.ln()) * (1.0 - progress)).exp());
            self.set_pd_targets(&current_angles, scale).await?;
            tokio::time::sleep(RAMP_STEP_HOLD).await;
        }
        self.set_pd_targets(&current_angles, 0.0).await?;

        let disable_futs = self.buses.iter().map(|bus| bus.disable_all());
        for result in futures::future::join_all(disable_futs).await {
            if let Err(e) = result {
                warn!(error = %e, "error disabling motors during ramp down");
            }
        }
        self.motors_enabled = false;
        Ok(())
    }

    pub fn motors_enabled(&self) -> bool {
        self.motors_enabled
    }

    pub fn discovered_actuators(&self) -> Vec<u8> {
        self.buses.iter().flat_map(|b| b.discovered().iter().copied()).collect()
    }
}

/// `exp(log(0.001) + i/29 * (log(1.0) - log(0.001)))`, the 30-step gain ramp.
fn log_ramp_step(i: usize) -> f64 {
    let low = 0.001_f64.ln();
    let high = 1.0_f64.ln();
    (low + (i as f64 / 29.0) * (high - low)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ramp_visits_30_monotonic_steps_from_near_zero_to_one() {
        let values: Vec<f64> = (0..RAMP_STEPS).map(log_ramp_step).collect();
        assert_eq!(values.len(), 30);
        assert!((values[0] - 0.001).abs() < 1e-6);
        assert!((values[29] - 1.0).abs() < 1e-6);
        for window in values.windows(2) {
            assert!(window[1] > window[0]);
        }
    }
}
