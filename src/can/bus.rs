//! Per-bus interface: socket ownership, discovery, and the request/response
//! protocol against one SocketCAN interface.

use super::fault::{classify_extended, classify_short};
use super::frame::{self, CanFrame};
use super::wire::{
    self, ExtendedFaultPayload, ParsedFrame, RawFeedback, MUX_EXTENDED_FAULT, MUX_FEEDBACK,
};
use crate::error::{FirmwareError, Result};
use std::collections::BTreeSet;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tracing::warn;

pub const ACTUATOR_RANGE: std::ops::Range<u8> = 10..50;
const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(10);
const ENABLE_PACING: Duration = Duration::from_millis(10);

/// Outcome of a bounded `receive(expected_mux)` call: either the frame the
/// caller was waiting for, or an explicit absence (timeout exhausted).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReceiveOutcome {
    Frame(ParsedFrame),
    Absent,
}

/// What `receive`'s bounded loop should do with one already-parsed inbound
/// frame. Factored out of the async loop so the classification rules
/// themselves — the actual "key algorithm" in spec.md §4.C — are testable
/// as plain data in, data out, with no socket or timeout involved.
///
/// `FirmwareError` is neither `Clone` nor `PartialEq`, so this enum derives
/// only `Debug`; tests match on variants rather than comparing with `==`.
#[derive(Debug)]
enum FrameDecision {
    /// This is the frame the caller was waiting for; stop reading.
    Return(ParsedFrame),
    /// Logged and absorbed (an extended fault/warning, or an unrelated
    /// mux); keep reading within the remaining time budget.
    Continue,
    /// A critical fault; propagate immediately, no further reads.
    Fatal(FirmwareError),
}

fn decide(parsed: ParsedFrame, expected_mux: u8) -> FrameDecision {
    if let Some(entry) = classify_short(parsed.fault_flags) {
        if entry.critical {
            return FrameDecision::Fatal(FirmwareError::CriticalFault {
                actuator_id: parsed.actuator_id,
                description: entry.description.to_string(),
            });
        }
        warn!(actuator_id = parsed.actuator_id, fault = entry.description, "non-critical fault");
    }

    if parsed.mux == expected_mux {
        return FrameDecision::Return(parsed);
    }

    if parsed.mux == MUX_EXTENDED_FAULT {
        let extended = ExtendedFaultPayload::from_payload(&parsed.payload);
        if let Some(entry) = classify_extended(extended.fault_bitmap) {
            if entry.critical {
                return FrameDecision::Fatal(FirmwareError::CriticalFault {
                    actuator_id: parsed.actuator_id,
                    description: entry.description.to_string(),
                });
            }
            warn!(actuator_id = parsed.actuator_id, fault = entry.description, "non-critical extended fault");
        }
        if let Some(entry) = classify_extended(extended.warning_bitmap) {
            warn!(actuator_id = parsed.actuator_id, fault = entry.description, "extended warning");
        }
        return FrameDecision::Continue;
    }

    warn!(actuator_id = parsed.actuator_id, mux = parsed.mux, expected = expected_mux, "unexpected mux");
    FrameDecision::Continue
}

struct RawSocket {
    // `OwnedFd` closes the descriptor on drop; bare `RawFd` would leak it.
    async_fd: AsyncFd<OwnedFd>,
}

impl RawSocket {
    fn bind(interface_name: &str) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::from(libc::AF_CAN),
            socket2::Type::RAW,
            Some(socket2::Protocol::from(libc::CAN_RAW)),
        )?;

        let if_index = unsafe {
            let cstr = std::ffi::CString::new(interface_name)
                .map_err(|_| FirmwareError::Can("invalid interface name".into()))?;
            libc::if_nametoindex(cstr.as_ptr())
        };
        if if_index == 0 {
            return Err(FirmwareError::BusAbsent(interface_name.to_string()));
        }

        let addr = libc::sockaddr_can {
            can_family: libc::AF_CAN as _,
            can_ifindex: if_index as i32,
            can_addr: unsafe { std::mem::zeroed() },
        };
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                &addr as *const _ as *const u8,
                &mut storage as *mut _ as *mut u8,
                std::mem::size_of::<libc::sockaddr_can>(),
            );
        }
        let sockaddr = unsafe {
            socket2::SockAddr::new(storage, std::mem::size_of::<libc::sockaddr_can>() as u32)
        };

        socket
            .bind(&sockaddr)
            .map_err(|_| FirmwareError::BusAbsent(interface_name.to_string()))?;
        socket.set_nonblocking(true)?;

        let owned_fd = unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) };
        let async_fd = AsyncFd::new(owned_fd)?;

        Ok(RawSocket { async_fd })
    }

    async fn send(&self, frame: &CanFrame) -> Result<()> {
        let bytes = frame::pack(*frame);
        loop {
            let mut guard = self.async_fd.writable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(inner.as_raw_fd(), bytes.as_ptr() as *const libc::c_void, bytes.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self) -> Result<CanFrame> {
        let mut buf = [0u8; 16];
        loop {
            let mut guard = self.async_fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else if n == 0 {
                    Err(io::Error::new(io::ErrorKind::UnexpectedEof, "socket closed"))
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(_)) => return frame::unpack(&buf),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    fn try_recv_nonblocking(&self) -> Result<Option<CanFrame>> {
        let mut buf = [0u8; 16];
        let n = unsafe {
            libc::read(
                self.async_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        Ok(Some(frame::unpack(&buf)?))
    }
}

/// Last-known feedback per actuator plus the per-bus miss counter spec §7
/// requires ("Timeout … increments a per-bus miss counter"). Factored out
/// of `BusInterface` so the cache/counter semantics round-trip scenario 6
/// exercises are testable as plain data in, data out, with no socket
/// involved — the same reason `decide` above is a free function.
#[derive(Debug, Default)]
struct FeedbackCache {
    last_known: std::collections::HashMap<u8, RawFeedback>,
    miss_count: u64,
}

impl FeedbackCache {
    /// Records one receive outcome: a `Frame` refreshes the actuator's
    /// last-known entry and is returned; an `Absent` increments the miss
    /// counter and yields `None`, leaving any prior last-known entry intact.
    fn record(&mut self, outcome: ReceiveOutcome) -> Option<(u8, RawFeedback)> {
        match outcome {
            ReceiveOutcome::Frame(parsed) => {
                let fb = RawFeedback::from_payload(&parsed.payload);
                self.last_known.insert(parsed.actuator_id, fb);
                Some((parsed.actuator_id, fb))
            }
            ReceiveOutcome::Absent => {
                self.miss_count += 1;
                None
            }
        }
    }

    fn last_known(&self, actuator_id: u8) -> Option<&RawFeedback> {
        self.last_known.get(&actuator_id)
    }
}

/// One owned, bound CAN socket plus the identifiers discovered on it and
/// their last-known feedback.
pub struct BusInterface {
    socket: RawSocket,
    interface_name: String,
    discovered: Vec<u8>,
    feedback: FeedbackCache,
}

impl BusInterface {
    pub fn bind(interface_name: &str) -> Result<Self> {
        let socket = RawSocket::bind(interface_name)?;
        Ok(BusInterface {
            socket,
            interface_name: interface_name.to_string(),
            discovered: Vec::new(),
            feedback: FeedbackCache::default(),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn discovered(&self) -> &[u8] {
        &self.discovered
    }

    pub fn last_known(&self, actuator_id: u8) -> Option<&RawFeedback> {
        self.feedback.last_known(actuator_id)
    }

    /// Count of feedback reads that timed out on this bus (spec §7's
    /// per-bus miss counter). Incremented once per `Absent` outcome from
    /// [`recv_feedback_response`](Self::recv_feedback_response) or
    /// [`send_pd_and_await`](Self::send_pd_and_await); last-known feedback
    /// is substituted for the caller in that case.
    pub fn miss_count(&self) -> u64 {
        self.feedback.miss_count
    }

    /// Sends a broadcast ping (id 0), then pings every identifier in the
    /// actuator range, recording which respond. Sorted, deduplicated by
    /// construction (`BTreeSet`). If the broadcast send itself fails the bus
    /// is declared absent.
    pub async fn discover(&mut self) -> Result<()> {
        let broadcast = wire::build_ping(0);
        self.socket
            .send(&broadcast)
            .await
            .map_err(|_| FirmwareError::BusAbsent(self.interface_name.clone()))?;
        let _ = tokio::time::timeout(DISCOVERY_TIMEOUT, self.socket.recv()).await;

        let mut found = BTreeSet::new();
        for actuator_id in ACTUATOR_RANGE {
            let ping = wire::build_ping(actuator_id);
            if self.socket.send(&ping).await.is_err() {
                continue;
            }
            if let Ok(Ok(frame)) = tokio::time::timeout(DISCOVERY_TIMEOUT, self.socket.recv()).await {
                if frame.mux() == wire::MUX_PING {
                    found.insert(actuator_id);
                }
            }
        }
        self.discovered = found.into_iter().collect();
        Ok(())
    }

    /// Bounded receive loop implementing the spec's receive discipline:
    /// extended-fault frames are classified and consumed transparently;
    /// anything else unexpected is logged and skipped; the whole loop is
    /// bounded by one overall timeout budget so recursion depth stays finite.
    pub async fn receive(&self, expected_mux: u8, budget: Duration) -> Result<ReceiveOutcome> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(ReceiveOutcome::Absent);
            }
            let frame = match tokio::time::timeout(remaining, self.socket.recv()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(_)) | Err(_) => return Ok(ReceiveOutcome::Absent),
            };

            let parsed = ParsedFrame::from_frame(&frame);
            match decide(parsed, expected_mux) {
                FrameDecision::Return(parsed) => return Ok(ReceiveOutcome::Frame(parsed)),
                FrameDecision::Continue => continue,
                FrameDecision::Fatal(err) => return Err(err),
            }
        }
    }

    pub async fn enable_all(&self) -> Result<()> {
        for id in self.discovered.clone() {
            let frame = wire::build_motor_enable(id);
            self.socket.send(&frame).await?;
            self.receive(MUX_FEEDBACK, Duration::from_secs(1)).await?;
        }
        Ok(())
    }

    pub async fn disable_all(&self) -> Result<()> {
        for id in self.discovered.clone() {
            let frame = wire::build_motor_disable(id);
            self.socket.send(&frame).await?;
            self.receive(MUX_FEEDBACK, Duration::from_secs(1)).await?;
            tokio::time::sleep(ENABLE_PACING).await;
        }
        Ok(())
    }

    pub async fn send_feedback_request(&self, actuator_id: u8) -> Result<()> {
        self.socket.send(&wire::build_feedback_request(actuator_id)).await
    }

    pub async fn recv_feedback_response(&mut self, timeout: Duration) -> Result<Option<(u8, RawFeedback)>> {
        let outcome = self.receive(MUX_FEEDBACK, timeout).await?;
        Ok(self.feedback.record(outcome))
    }

    pub async fn send_pd_and_await(
        &mut self,
        actuator_id: u8,
        raw_torque_ff: u16,
        raw_angle: u16,
        raw_velocity: u16,
        raw_kp: u16,
        raw_kd: u16,
    ) -> Result<()> {
        let frame = wire::build_pd_command(actuator_id, raw_torque_ff, raw_angle, raw_velocity, raw_kp, raw_kd);
        self.socket.send(&frame).await?;
        let outcome = self.receive(wire::MUX_FEEDBACK, Duration::from_millis(50)).await?;
        if matches!(outcome, ReceiveOutcome::Absent) {
            warn!(actuator_id, "missing PD feedback response, discarded");
        }
        self.feedback.record(outcome);
        Ok(())
    }

    /// Drains any stray frames sitting in the socket buffer without blocking.
    /// Returns the number of frames drained.
    pub fn flush(&self) -> Result<usize> {
        let mut drained = 0;
        while self.socket.try_recv_nonblocking()?.is_some() {
            drained += 1;
        }
        Ok(drained)
    }

    pub fn close(self) {
        // The underlying `OwnedFd` closes the socket on drop.
        drop(self);
    }
}

#[cfg(test)]
fn parsed_feedback_frame(actuator_id: u8, fault_flags: u8) -> ParsedFrame {
    ParsedFrame {
        host_id: frame::HOST_ID,
        actuator_id,
        fault_flags,
        mode_status: 0,
        mux: MUX_FEEDBACK,
        payload: [0; 8],
    }
}

#[cfg(test)]
fn parsed_extended_fault_frame(actuator_id: u8, fault_bitmap: u32) -> ParsedFrame {
    let mut payload = [0u8; 8];
    payload[0..4].copy_from_slice(&fault_bitmap.to_le_bytes());
    ParsedFrame {
        host_id: frame::HOST_ID,
        actuator_id,
        fault_flags: 0,
        mode_status: 0,
        mux: MUX_EXTENDED_FAULT,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Spec scenario 3: an extended fault frame carrying a non-critical
    // (warning-only) code is absorbed transparently; the caller's actual
    // expected frame is still returned.
    #[test]
    fn warning_extended_fault_is_absorbed_then_expected_frame_returns() {
        let warning = parsed_extended_fault_frame(21, 0x0000_0004); // under-voltage, non-critical
        assert!(matches!(decide(warning, MUX_FEEDBACK), FrameDecision::Continue));

        let feedback = parsed_feedback_frame(21, 0);
        match decide(feedback, MUX_FEEDBACK) {
            FrameDecision::Return(returned) => assert_eq!(returned, feedback),
            other => panic!("expected the feedback frame to return, got {other:?}"),
        }
    }

    // Spec scenario 4: an extended fault frame carrying a critical code
    // raises `CriticalFault` immediately; no further receive is attempted.
    #[test]
    fn critical_extended_fault_is_fatal() {
        let critical = parsed_extended_fault_frame(14, 0x0000_0001); // over-temperature, critical
        match decide(critical, MUX_FEEDBACK) {
            FrameDecision::Fatal(FirmwareError::CriticalFault { actuator_id, .. }) => {
                assert_eq!(actuator_id, 14);
            }
            other => panic!("expected a critical fault, got {other:?}"),
        }
    }

    // Spec scenario 6 (partial): an in-band (short) critical fault flag on
    // an otherwise-matching feedback frame still raises before the frame is
    // ever handed back, even though the mux matched what was awaited.
    #[test]
    fn short_critical_fault_preempts_a_matching_mux() {
        let over_current = parsed_feedback_frame(22, 0x02); // over-current, critical
        match decide(over_current, MUX_FEEDBACK) {
            FrameDecision::Fatal(FirmwareError::CriticalFault { actuator_id, .. }) => {
                assert_eq!(actuator_id, 22);
            }
            other => panic!("expected a critical fault, got {other:?}"),
        }
    }

    #[test]
    fn short_non_critical_fault_does_not_block_the_matching_frame() {
        let under_voltage = parsed_feedback_frame(22, 0x04); // under-voltage, non-critical
        match decide(under_voltage, MUX_FEEDBACK) {
            FrameDecision::Return(returned) => assert_eq!(returned, under_voltage),
            other => panic!("expected the feedback frame to return, got {other:?}"),
        }
    }

    #[test]
    fn an_unrelated_mux_is_logged_and_skipped() {
        let ping = ParsedFrame {
            host_id: frame::HOST_ID,
            actuator_id: 12,
            fault_flags: 0,
            mode_status: 0,
            mux: wire::MUX_PING,
            payload: [0; 8],
        };
        assert!(matches!(decide(ping, MUX_FEEDBACK), FrameDecision::Continue));
    }

    // Spec scenario 5: discovery on a bus where an identifier responds more
    // than once still yields a sorted, deduplicated list.
    #[test]
    fn discovered_list_type_is_sorted_and_deduplicated_by_construction() {
        let mut found = BTreeSet::new();
        for id in [12u8, 14, 12] {
            found.insert(id);
        }
        let discovered: Vec<u8> = found.into_iter().collect();
        assert_eq!(discovered, vec![12, 14]);
    }

    // Spec scenario 6: actuator 21 times out while 22 responds. The joint
    // map must still contain 21 (from last-known) and 22 (fresh), and the
    // bus's miss counter increments by exactly 1.
    #[test]
    fn scenario_6_timeout_substitutes_last_known_and_counts_the_miss() {
        let mut cache = FeedbackCache::default();

        // A prior successful tick populates 21's last-known entry.
        let prior = parsed_feedback_frame(21, 0);
        assert!(cache.record(ReceiveOutcome::Frame(prior)).is_some());
        assert_eq!(cache.miss_count, 0);

        // This tick: 21 times out, 22 responds fresh.
        let timed_out = cache.record(ReceiveOutcome::Absent);
        let fresh = cache.record(ReceiveOutcome::Frame(parsed_feedback_frame(22, 0)));

        assert!(timed_out.is_none());
        assert_eq!(cache.miss_count, 1);
        assert!(cache.last_known(21).is_some(), "21's last-known entry must survive the miss");
        assert_eq!(fresh.map(|(id, _)| id), Some(22));
    }

    #[test]
    fn repeated_misses_accumulate_on_the_same_cache() {
        let mut cache = FeedbackCache::default();
        for _ in 0..3 {
            assert!(cache.record(ReceiveOutcome::Absent).is_none());
        }
        assert_eq!(cache.miss_count, 3);
    }
}
