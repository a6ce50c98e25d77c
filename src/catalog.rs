//! Actuator Catalog — static joint metadata and physical/wire unit conversion.
//!
//! Extracted from the reference firmware's `firmware/actuators.py`.

use std::collections::HashMap;
use std::f64::consts::PI;

/// One of the five Robstride actuator families, each with its own
/// angle/velocity/torque/gain ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActuatorFamily {
    Robstride00,
    Robstride01,
    Robstride02,
    Robstride03,
    Robstride04,
}

/// Min/max endpoints for one physical quantity.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

/// The five ranges a family defines: angle, velocity, torque, kp, kd.
#[derive(Debug, Clone, Copy)]
pub struct FamilyRanges {
    pub angle: Range,
    pub velocity: Range,
    pub torque: Range,
    pub kp: Range,
    pub kd: Range,
}

/// Selects which of a family's ranges a conversion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Angle,
    Velocity,
    Torque,
    Kp,
    Kd,
}

const WIRE_MIN: f64 = 0.0;
const WIRE_MAX: f64 = u16::MAX as f64;

impl ActuatorFamily {
    pub fn ranges(&self) -> FamilyRanges {
        match self {
            ActuatorFamily::Robstride00 => FamilyRanges {
                angle: Range { min: -4.0 * PI, max: 4.0 * PI },
                velocity: Range { min: -33.0, max: 33.0 },
                torque: Range { min: -14.0, max: 14.0 },
                kp: Range { min: 0.0, max: 500.0 },
                kd: Range { min: 0.0, max: 5.0 },
            },
            ActuatorFamily::Robstride01 => FamilyRanges {
                angle: Range { min: -4.0 * PI, max: 4.0 * PI },
                velocity: Range { min: -44.0, max: 44.0 },
                torque: Range { min: -17.0, max: 17.0 },
                kp: Range { min: 0.0, max: 500.0 },
                kd: Range { min: 0.0, max: 5.0 },
            },
            ActuatorFamily::Robstride02 => FamilyRanges {
                angle: Range { min: -4.0 * PI, max: 4.0 * PI },
                velocity: Range { min: -44.0, max: 44.0 },
                torque: Range { min: -17.0, max: 17.0 },
                kp: Range { min: 0.0, max: 500.0 },
                kd: Range { min: 0.0, max: 5.0 },
            },
            ActuatorFamily::Robstride03 => FamilyRanges {
                angle: Range { min: -4.0 * PI, max: 4.0 * PI },
                velocity: Range { min: -20.0, max: 20.0 },
                torque: Range { min: -60.0, max: 60.0 },
                kp: Range { min: 0.0, max: 5000.0 },
                kd: Range { min: 0.0, max: 100.0 },
            },
            ActuatorFamily::Robstride04 => FamilyRanges {
                angle: Range { min: -4.0 * PI, max: 4.0 * PI },
                velocity: Range { min: -15.0, max: 15.0 },
                torque: Range { min: -120.0, max: 120.0 },
                kp: Range { min: 0.0, max: 5000.0 },
                kd: Range { min: 0.0, max: 100.0 },
            },
        }
    }

    fn field_range(&self, field: Field) -> Range {
        let r = self.ranges();
        match field {
            Field::Angle => r.angle,
            Field::Velocity => r.velocity,
            Field::Torque => r.torque,
            Field::Kp => r.kp,
            Field::Kd => r.kd,
        }
    }

    /// Normalises a physical value to a wire-range u16, saturating out-of-range
    /// inputs into [0, 65535] instead of panicking.
    pub fn physical_to_wire(&self, field: Field, value: f64) -> u16 {
        let range = self.field_range(field);
        let proportion = (value - range.min) / (range.max - range.min);
        let wire = WIRE_MIN + proportion * (WIRE_MAX - WIRE_MIN);
        wire.round().clamp(WIRE_MIN, WIRE_MAX) as u16
    }

    /// Inverse of [`physical_to_wire`](Self::physical_to_wire).
    pub fn wire_to_physical(&self, field: Field, raw: u16) -> f64 {
        let range = self.field_range(field);
        let proportion = (raw as f64 - WIRE_MIN) / (WIRE_MAX - WIRE_MIN);
        range.min + proportion * (range.max - range.min)
    }
}

/// Temperature uses a fixed scale regardless of actuator family.
pub fn wire_to_temperature(raw: u16) -> f64 {
    raw as f64 / 10.0
}

/// Static descriptor for one joint: identifier, family, commanded gains,
/// and home bias. Immutable once built.
#[derive(Debug, Clone)]
pub struct ActuatorDescriptor {
    pub can_id: u8,
    pub full_name: &'static str,
    pub family: ActuatorFamily,
    pub kp: f64,
    pub kd: f64,
    pub joint_bias: f64,
}

impl ActuatorDescriptor {
    /// Short joint name, e.g. `dof_left_elbow_02` -> `left_elbow`.
    pub fn short_name(&self) -> String {
        let trimmed = self.full_name.strip_prefix("dof_").unwrap_or(self.full_name);
        let parts: Vec<&str> = trimmed.split('_').collect();
        if parts.len() <= 1 {
            trimmed.to_string()
        } else {
            parts[..parts.len() - 1].join("_")
        }
    }
}

/// Immutable mapping from CAN identifier to descriptor, covering all joints.
/// Built once at startup from the hard-coded table below; read-only thereafter.
#[derive(Debug, Clone)]
pub struct RobotConfig {
    actuators: HashMap<u8, ActuatorDescriptor>,
    name_to_id: HashMap<&'static str, u8>,
}

impl RobotConfig {
    pub fn new() -> Self {
        let actuators = build_actuator_table();
        let name_to_id = actuators
            .values()
            .map(|a| (a.full_name, a.can_id))
            .collect();
        RobotConfig { actuators, name_to_id }
    }

    pub fn descriptor(&self, can_id: u8) -> Option<&ActuatorDescriptor> {
        self.actuators.get(&can_id)
    }

    pub fn id_for_name(&self, full_name: &str) -> Option<u8> {
        self.name_to_id.get(full_name).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.actuators.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActuatorDescriptor> {
        self.actuators.values()
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn deg(d: f64) -> f64 {
    d.to_radians()
}

/// The 22-joint table: left/right arms (ids 11-16, 21-26) and left/right
/// legs (ids 31-35, 41-45).
fn build_actuator_table() -> HashMap<u8, ActuatorDescriptor> {
    use ActuatorFamily::*;

    let rows: &[(u8, &'static str, ActuatorFamily, f64, f64, f64)] = &[
        // Left arm
        (11, "dof_left_shoulder_pitch_03", Robstride03, 100.0, 8.284, 0.0),
        (12, "dof_left_shoulder_roll_03", Robstride03, 100.0, 8.257, deg(10.0)),
        (13, "dof_left_shoulder_yaw_02", Robstride02, 100.0, 2.945, 0.0),
        (14, "dof_left_elbow_02", Robstride02, 80.0, 2.266, deg(-90.0)),
        (15, "dof_left_wrist_00", Robstride00, 20.0, 0.295, 0.0),
        (16, "dof_left_wrist_gripper_05", Robstride00, 4.0, 0.06, 0.0),
        // Right arm
        (21, "dof_right_shoulder_pitch_03", Robstride03, 100.0, 8.284, 0.0),
        (22, "dof_right_shoulder_roll_03", Robstride03, 100.0, 8.257, deg(-10.0)),
        (23, "dof_right_shoulder_yaw_02", Robstride02, 100.0, 2.945, 0.0),
        (24, "dof_right_elbow_02", Robstride02, 100.0, 2.266, deg(90.0)),
        (25, "dof_right_wrist_00", Robstride00, 20.0, 0.295, 0.0),
        (26, "dof_right_wrist_gripper_05", Robstride00, 4.0, 0.06, 0.0),
        // Left leg
        (31, "dof_left_hip_pitch_04", Robstride04, 150.0, 24.722, deg(20.0)),
        (32, "dof_left_hip_roll_03", Robstride03, 200.0, 26.387, 0.0),
        (33, "dof_left_hip_yaw_03", Robstride03, 100.0, 3.419, 0.0),
        (34, "dof_left_knee_04", Robstride04, 150.0, 8.654, deg(50.0)),
        (35, "dof_left_ankle_02", Robstride02, 40.0, 0.99, deg(-30.0)),
        // Right leg
        (41, "dof_right_hip_pitch_04", Robstride04, 150.0, 24.722, deg(-20.0)),
        (42, "dof_right_hip_roll_03", Robstride03, 200.0, 26.387, 0.0),
        (43, "dof_right_hip_yaw_03", Robstride03, 100.0, 3.419, 0.0),
        (44, "dof_right_knee_04", Robstride04, 150.0, 8.654, deg(-50.0)),
        (45, "dof_right_ankle_02", Robstride02, 40.0, 0.99, deg(30.0)),
    ];

    rows.iter()
        .map(|&(can_id, full_name, family, kp, kd, joint_bias)| {
            (
                can_id,
                ActuatorDescriptor {
                    can_id,
                    full_name,
                    family,
                    kp,
                    kd,
                    joint_bias,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_22_joints_in_bus_range() {
        let cfg = RobotConfig::new();
        assert_eq!(cfg.len(), 22);
        for id in cfg.ids() {
            assert!((10..50).contains(&id));
        }
    }

    #[test]
    fn name_lookup_round_trips_can_id() {
        let cfg = RobotConfig::new();
        let id = cfg.id_for_name("dof_left_elbow_02").unwrap();
        assert_eq!(id, 14);
        assert_eq!(cfg.descriptor(id).unwrap().full_name, "dof_left_elbow_02");
    }

    #[test]
    fn physical_to_wire_round_trips_within_one_count() {
        for raw in [0u16, 1, 1000, 32767, 32768, 65534, 65535] {
            let physical = ActuatorFamily::Robstride03.wire_to_physical(Field::Angle, raw);
            let back = ActuatorFamily::Robstride03.physical_to_wire(Field::Angle, physical);
            assert!((back as i32 - raw as i32).abs() <= 1, "raw={raw} back={back}");
        }
    }

    #[test]
    fn physical_to_wire_saturates_out_of_range() {
        let wire = ActuatorFamily::Robstride00.physical_to_wire(Field::Angle, 1000.0);
        assert_eq!(wire, u16::MAX);
        let wire = ActuatorFamily::Robstride00.physical_to_wire(Field::Angle, -1000.0);
        assert_eq!(wire, 0);
    }

    #[test]
    fn wire_to_temperature_uses_fixed_tenth_scale() {
        assert_eq!(wire_to_temperature(200), 20.0);
    }

    #[test]
    fn mid_range_wire_maps_to_zero_angle() {
        // Scenario 1 fixture: angle endpoints +-4*pi, mid-wire ~ 0 rad.
        let mid = ActuatorFamily::Robstride03.wire_to_physical(Field::Angle, 32767);
        assert!(mid.abs() < 0.01, "mid={mid}");
    }
}
