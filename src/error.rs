use thiserror::Error;

pub type Result<T> = std::result::Result<T, FirmwareError>;

/// Unified error taxonomy for the driver, control loop, and shutdown path.
///
/// `MalformedFrame` through `UnexpectedMux` are transport errors absorbed
/// locally by the per-bus interface. `NonCriticalFault` is logged and
/// ignored. `CriticalFault` and the startup errors propagate out of the
/// driver and trigger the shutdown sequence.
#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed CAN frame: {0}")]
    MalformedFrame(String),

    #[error("timeout waiting for response from actuator {0}")]
    Timeout(u8),

    #[error("unexpected mux 0x{mux:02x} while awaiting 0x{expected:02x} from actuator {actuator_id}")]
    UnexpectedMux {
        actuator_id: u8,
        mux: u8,
        expected: u8,
    },

    #[error("actuator {actuator_id} warning fault: {description}")]
    NonCriticalFault { actuator_id: u8, description: String },

    #[error("actuator {actuator_id} critical fault: {description}")]
    CriticalFault { actuator_id: u8, description: String },

    #[error("CAN interface error: {0}")]
    Can(String),

    #[error("bus {0} absent: bind or initial broadcast failed")]
    BusAbsent(String),

    #[error("startup invariant violated: {0}")]
    StartupInvariantViolated(String),

    #[error("policy archive invalid: {0}")]
    ArchiveInvalid(String),

    #[error("actuator not found: {0}")]
    ActuatorNotFound(u8),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<tokio::time::error::Elapsed> for FirmwareError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FirmwareError::Timeout(0)
    }
}
