//! CAN bus transport: frame codec, message framing, fault taxonomies, and
//! the per-bus socket interface.

pub mod bus;
pub mod fault;
pub mod frame;
pub mod wire;

pub use bus::BusInterface;
pub use frame::CanFrame;
