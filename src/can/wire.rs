//! Message-specific framing on top of the raw 16-byte [`CanFrame`](super::frame::CanFrame).
//!
//! Replaces the duck-typed "string-keyed map" framing of the reference
//! implementation with tagged records, per the redesign guidance to model
//! frames as `ParsedFrame { host_id, actuator_id, fault_flags, mode_status,
//! mux, payload }` rather than dynamically-typed dictionaries.

use super::frame::{CanFrame, CAN_MAX_DLEN, HOST_ID};

pub const MUX_PING: u8 = 0x00;
pub const MUX_CONTROL: u8 = 0x01;
pub const MUX_FEEDBACK: u8 = 0x02;
pub const MUX_MOTOR_ENABLE: u8 = 0x03;
pub const MUX_MOTOR_DISABLE: u8 = 0x04;
pub const MUX_EXTENDED_FAULT: u8 = 0x15;

/// One fully decoded inbound frame. The fault byte packs a 6-bit fault-flag
/// field in its low bits and a 2-bit mode-status field in its high two bits,
/// per the data model's feedback-record definition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedFrame {
    pub host_id: u8,
    pub actuator_id: u8,
    pub fault_flags: u8,
    pub mode_status: u8,
    pub mux: u8,
    pub payload: [u8; CAN_MAX_DLEN],
}

impl ParsedFrame {
    pub fn from_frame(frame: &CanFrame) -> Self {
        let (host_id, actuator_id, fault_byte, mux) = frame.inbound_header();
        ParsedFrame {
            host_id,
            actuator_id,
            fault_flags: fault_byte & 0x3F,
            mode_status: (fault_byte >> 6) & 0x03,
            mux,
            payload: frame.data,
        }
    }
}

/// Decoded state-feedback payload, raw wire units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawFeedback {
    pub angle_raw: u16,
    pub velocity_raw: u16,
    pub torque_raw: u16,
    pub temperature_raw: u16,
}

fn be_u16(payload: &[u8; CAN_MAX_DLEN], offset: usize) -> u16 {
    u16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn be_u16_bytes(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

impl RawFeedback {
    pub fn from_payload(payload: &[u8; CAN_MAX_DLEN]) -> Self {
        RawFeedback {
            angle_raw: be_u16(payload, 0),
            velocity_raw: be_u16(payload, 2),
            torque_raw: be_u16(payload, 4),
            temperature_raw: be_u16(payload, 6),
        }
    }
}

/// Two little-endian u32 bitmaps carried by the extended fault frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExtendedFaultPayload {
    pub fault_bitmap: u32,
    pub warning_bitmap: u32,
}

impl ExtendedFaultPayload {
    pub fn from_payload(payload: &[u8; CAN_MAX_DLEN]) -> Self {
        let fault_bitmap = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let warning_bitmap = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        ExtendedFaultPayload {
            fault_bitmap,
            warning_bitmap,
        }
    }
}

/// Ping/discovery frame, identical payload in both directions.
pub fn build_ping(actuator_id: u8) -> CanFrame {
    CanFrame::build(actuator_id, HOST_ID as u16, MUX_PING, [0; CAN_MAX_DLEN])
}

pub fn build_motor_enable(actuator_id: u8) -> CanFrame {
    CanFrame::build(actuator_id, HOST_ID as u16, MUX_MOTOR_ENABLE, [0; CAN_MAX_DLEN])
}

pub fn build_motor_disable(actuator_id: u8) -> CanFrame {
    CanFrame::build(actuator_id, HOST_ID as u16, MUX_MOTOR_DISABLE, [0; CAN_MAX_DLEN])
}

pub fn build_feedback_request(actuator_id: u8) -> CanFrame {
    CanFrame::build(actuator_id, HOST_ID as u16, MUX_FEEDBACK, [0; CAN_MAX_DLEN])
}

/// PD command: byte0 = actuator id, bytes1-2 = raw torque feed-forward,
/// byte3 = mux. Payload is big-endian: angle, angular velocity, scaled kp,
/// scaled kd.
pub fn build_pd_command(
    actuator_id: u8,
    raw_torque_ff: u16,
    raw_angle: u16,
    raw_velocity: u16,
    raw_kp: u16,
    raw_kd: u16,
) -> CanFrame {
    let mut payload = [0u8; CAN_MAX_DLEN];
    payload[0..2].copy_from_slice(&be_u16_bytes(raw_angle));
    payload[2..4].copy_from_slice(&be_u16_bytes(raw_velocity));
    payload[4..6].copy_from_slice(&be_u16_bytes(raw_kp));
    payload[6..8].copy_from_slice(&be_u16_bytes(raw_kd));
    CanFrame::build(actuator_id, raw_torque_ff, MUX_CONTROL, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_frame_splits_fault_and_mode_status() {
        let frame = CanFrame::build(0xFD, 12, 0x02, [0; 8]);
        // fault byte lives at byte2 of an inbound frame == bits 16-23 of can_id.
        let can_id = frame.can_id | (0b11_000101u32 << 16);
        let inbound = CanFrame { can_id, ..frame };
        let parsed = ParsedFrame::from_frame(&inbound);
        assert_eq!(parsed.fault_flags, 0b000101);
        assert_eq!(parsed.mode_status, 0b11);
        assert_eq!(parsed.mux, MUX_FEEDBACK);
    }

    #[test]
    fn feedback_payload_decodes_big_endian_fields() {
        let payload = [0x00, 0x00, 0x80, 0x00, 0x80, 0x00, 0x00, 0xC8];
        let fb = RawFeedback::from_payload(&payload);
        assert_eq!(fb.angle_raw, 0x0000);
        assert_eq!(fb.velocity_raw, 0x8000);
        assert_eq!(fb.torque_raw, 0x8000);
        assert_eq!(fb.temperature_raw, 0x00C8);
    }

    #[test]
    fn extended_fault_payload_decodes_little_endian_bitmaps() {
        let payload = [0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let fault = ExtendedFaultPayload::from_payload(&payload);
        assert_eq!(fault.fault_bitmap, 0x0000_0004);
        assert_eq!(fault.warning_bitmap, 0);
    }

    #[test]
    fn pd_command_places_actuator_id_and_torque_in_identifier() {
        let frame = build_pd_command(11, 0, 32767, 0, 500, 2714);
        assert_eq!(frame.can_id & 0xFF, 11);
        assert_eq!(frame.mux(), MUX_CONTROL);
    }
}
