//! Command source adapter: a non-blocking reader publishing a map from
//! command name to float, plus any joint-level angle overrides.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Pose-style command clamp, e.g. base height/lean.
pub const POSE_CLAMP: f64 = 0.3;
/// Velocity-style command clamp, e.g. base forward/yaw rate.
pub const VELOCITY_CLAMP: f64 = 0.8;

/// The current command snapshot: a named vector plus any joint-level
/// target overrides keyed by full joint name.
#[derive(Debug, Clone, Default)]
pub struct CommandSnapshot {
    pub commands: HashMap<String, f64>,
    pub joint_overrides: HashMap<String, f64>,
}

/// A non-blocking source of command snapshots. The control loop calls
/// `snapshot()` once per tick and never blocks on it.
pub trait CommandSource: Send + Sync {
    fn snapshot(&self) -> CommandSnapshot;
}

struct SharedState {
    commands: HashMap<String, f64>,
    joint_overrides: HashMap<String, f64>,
}

impl SharedState {
    fn new(names: &[&'static str]) -> Self {
        SharedState {
            commands: names.iter().map(|&n| (n.to_string(), 0.0)).collect(),
            joint_overrides: HashMap::new(),
        }
    }
}

const BASE_COMMAND_NAMES: [&str; 6] =
    ["vx", "vy", "yaw_rate", "base_height", "base_roll", "base_pitch"];

/// TTY keyboard reader: a background thread reads stdin in cbreak mode and
/// updates named command deltas per keystroke, clamped to `±0.3`.
pub struct Keyboard {
    state: Arc<Mutex<SharedState>>,
}

impl Keyboard {
    /// Spawns the background reader thread. `raw_input` receives one
    /// lowercase character per keystroke (the terminal-mode plumbing is the
    /// caller's concern; tests drive this channel directly).
    pub fn spawn(raw_input: std::sync::mpsc::Receiver<char>) -> Self {
        let state = Arc::new(Mutex::new(SharedState::new(&BASE_COMMAND_NAMES)));
        let worker_state = state.clone();
        std::thread::spawn(move || {
            while let Ok(ch) = raw_input.recv() {
                Self::apply_key(&worker_state, ch);
            }
        });
        Keyboard { state }
    }

    fn apply_key(state: &Arc<Mutex<SharedState>>, ch: char) {
        let mut s = state.lock().unwrap();
        match ch {
            '0' => {
                for v in s.commands.values_mut() {
                    *v = 0.0;
                }
            }
            'w' => bump(&mut s.commands, "vx", 0.1),
            's' => bump(&mut s.commands, "vx", -0.1),
            'a' => bump(&mut s.commands, "vy", 0.1),
            'd' => bump(&mut s.commands, "vy", -0.1),
            'q' => bump(&mut s.commands, "yaw_rate", 0.1),
            'e' => bump(&mut s.commands, "yaw_rate", -0.1),
            '=' => bump(&mut s.commands, "base_height", 0.05),
            '-' => bump(&mut s.commands, "base_height", -0.05),
            'r' => bump(&mut s.commands, "base_roll", 0.1),
            'f' => bump(&mut s.commands, "base_roll", -0.1),
            't' => bump(&mut s.commands, "base_pitch", 0.1),
            'g' => bump(&mut s.commands, "base_pitch", -0.1),
            _ => {}
        }
        for v in s.commands.values_mut() {
            *v = v.clamp(-POSE_CLAMP, POSE_CLAMP);
        }
    }
}

fn bump(commands: &mut HashMap<String, f64>, name: &str, delta: f64) {
    *commands.entry(name.to_string()).or_insert(0.0) += delta;
}

impl CommandSource for Keyboard {
    fn snapshot(&self) -> CommandSnapshot {
        let s = self.state.lock().unwrap();
        CommandSnapshot { commands: s.commands.clone(), joint_overrides: s.joint_overrides.clone() }
    }
}

/// UDP JSON listener: one datagram per update on `port`. Accepted shapes:
/// `{"type": "reset"}`, `{"commands": {name: value, ...}}`, or a bare
/// `{name: value, ...}` object. Unknown names are ignored with a warning.
pub struct UdpCommandSource {
    state: Arc<Mutex<SharedState>>,
}

impl UdpCommandSource {
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let state = Arc::new(Mutex::new(SharedState::new(&BASE_COMMAND_NAMES)));
        let worker_state = state.clone();
        std::thread::spawn(move || Self::read_loop(socket, worker_state));
        Ok(UdpCommandSource { state })
    }

    fn read_loop(socket: UdpSocket, state: Arc<Mutex<SharedState>>) {
        let mut buf = [0u8; 1024];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, _addr)) => Self::handle_packet(&buf[..len], &state),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "udp command source read failed");
                    continue;
                }
            }
        }
    }

    fn handle_packet(bytes: &[u8], state: &Arc<Mutex<SharedState>>) {
        let value: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed udp command packet");
                return;
            }
        };

        let mut s = state.lock().unwrap();
        if value.get("type").and_then(|t| t.as_str()) == Some("reset") {
            for v in s.commands.values_mut() {
                *v = 0.0;
            }
            s.joint_overrides.clear();
            return;
        }

        let payload = value.get("commands").unwrap_or(&value);
        let Some(map) = payload.as_object() else { return };
        for (name, v) in map {
            let Some(value) = v.as_f64() else { continue };
            if BASE_COMMAND_NAMES.contains(&name.as_str()) {
                s.commands.insert(name.clone(), value.clamp(-VELOCITY_CLAMP, VELOCITY_CLAMP));
            } else if let Some(joint) = joint_name_for_alias(name) {
                s.joint_overrides.insert(joint.to_string(), value);
            } else {
                warn!(name = name.as_str(), "unknown command name, ignoring");
            }
        }
    }
}

impl CommandSource for UdpCommandSource {
    fn snapshot(&self) -> CommandSnapshot {
        let s = self.state.lock().unwrap();
        CommandSnapshot { commands: s.commands.clone(), joint_overrides: s.joint_overrides.clone() }
    }
}

/// Maps short per-limb aliases used by external controllers to full joint
/// descriptor names.
fn joint_name_for_alias(alias: &str) -> Option<&'static str> {
    match alias {
        "rshoulderpitch" => Some("dof_right_shoulder_pitch_03"),
        "rshoulderroll" => Some("dof_right_shoulder_roll_03"),
        "rshoulderyaw" => Some("dof_right_shoulder_yaw_02"),
        "relbowpitch" => Some("dof_right_elbow_02"),
        "rwristroll" => Some("dof_right_wrist_00"),
        "rgripper" => Some("dof_right_wrist_gripper_05"),
        "lshoulderpitch" => Some("dof_left_shoulder_pitch_03"),
        "lshoulderroll" => Some("dof_left_shoulder_roll_03"),
        "lshoulderyaw" => Some("dof_left_shoulder_yaw_02"),
        "lelbowpitch" => Some("dof_left_elbow_02"),
        "lwristroll" => Some("dof_left_wrist_00"),
        "lgripper" => Some("dof_left_wrist_gripper_05"),
        _ => None,
    }
}

/// Fixed-zero command source, used when no external controller is attached.
pub struct DummyCommandSource;

impl CommandSource for DummyCommandSource {
    fn snapshot(&self) -> CommandSnapshot {
        CommandSnapshot::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_clamps_accumulated_deltas_to_pose_range() {
        let (tx, rx) = std::sync::mpsc::channel();
        let keyboard = Keyboard::spawn(rx);
        for _ in 0..10 {
            tx.send('w').unwrap();
        }
        drop(tx);
        std::thread::sleep(Duration::from_millis(50));
        let snapshot = keyboard.snapshot();
        assert!((snapshot.commands["vx"] - POSE_CLAMP).abs() < 1e-9);
    }

    #[test]
    fn keyboard_zero_key_resets_all_commands() {
        let (tx, rx) = std::sync::mpsc::channel();
        let keyboard = Keyboard::spawn(rx);
        tx.send('w').unwrap();
        tx.send('0').unwrap();
        drop(tx);
        std::thread::sleep(Duration::from_millis(50));
        let snapshot = keyboard.snapshot();
        assert!(snapshot.commands.values().all(|&v| v == 0.0));
    }

    #[test]
    fn unknown_alias_is_ignored_not_stored() {
        assert_eq!(joint_name_for_alias("not_a_joint"), None);
    }

    #[test]
    fn dummy_command_source_reports_an_empty_snapshot() {
        let snapshot = DummyCommandSource.snapshot();
        assert!(snapshot.commands.is_empty());
        assert!(snapshot.joint_overrides.is_empty());
    }
}
