//! Policy runtime adapter: loads the `.kinfer` archive and exposes the
//! opaque `(init_fn, step_fn)` pair the control loop steps each tick.
//!
//! The inference runtime itself is out of scope; [`PolicyRuntime`] is the
//! seam an embedder implements against the extracted ONNX graph bytes.

use crate::error::{FirmwareError, Result};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

/// Parsed `metadata.json` member of a policy archive.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyMetadata {
    pub joint_names: Vec<String>,
    pub command_names: Vec<String>,
    #[serde(default)]
    pub joint_biases: Vec<f64>,
}

/// The three members of a `.kinfer` archive, extracted into memory.
pub struct PolicyArchive {
    pub init_fn: Vec<u8>,
    pub step_fn: Vec<u8>,
    pub metadata: PolicyMetadata,
}

const REQUIRED_MEMBERS: [&str; 3] = ["init_fn.onnx", "step_fn.onnx", "metadata.json"];

impl PolicyArchive {
    /// Reads a gzip-compressed tar archive with exactly the three members
    /// named `init_fn.onnx`, `step_fn.onnx`, `metadata.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) != Some("kinfer") {
            return Err(FirmwareError::ArchiveInvalid(format!(
                "{} does not have a .kinfer extension",
                path.display()
            )));
        }

        let file = std::fs::File::open(path)?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);

        let mut init_fn = None;
        let mut step_fn = None;
        let mut metadata = None;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            match name.as_str() {
                "init_fn.onnx" => init_fn = Some(bytes),
                "step_fn.onnx" => step_fn = Some(bytes),
                "metadata.json" => {
                    metadata = Some(serde_json::from_slice::<PolicyMetadata>(&bytes).map_err(|e| {
                        FirmwareError::ArchiveInvalid(format!("malformed metadata.json: {e}"))
                    })?);
                }
                other => {
                    return Err(FirmwareError::ArchiveInvalid(format!("unexpected archive member {other}")));
                }
            }
        }

        let init_fn = init_fn.ok_or_else(|| missing_member("init_fn.onnx"))?;
        let step_fn = step_fn.ok_or_else(|| missing_member("step_fn.onnx"))?;
        let metadata = metadata.ok_or_else(|| missing_member("metadata.json"))?;

        if metadata.joint_names.is_empty() {
            return Err(FirmwareError::ArchiveInvalid("metadata.json has no joint_names".into()));
        }

        Ok(PolicyArchive { init_fn, step_fn, metadata })
    }

    pub fn member_names() -> &'static [&'static str] {
        &REQUIRED_MEMBERS
    }
}

fn missing_member(name: &str) -> FirmwareError {
    FirmwareError::ArchiveInvalid(format!("archive missing required member {name}"))
}

/// Opaque recurrent state threaded between policy step invocations.
pub struct Carry(pub Vec<u8>);

/// The stepping contract the control loop drives once per tick. An
/// embedder wraps a real inference session around [`PolicyArchive`] bytes;
/// [`DummyPolicyRuntime`] exercises the loop without one.
pub trait PolicyRuntime: Send {
    fn init(&mut self) -> Carry;

    /// `observation` is the concatenation the caller has already assembled
    /// (joint angles/velocities, projected gravity, gyroscope, command
    /// vector) in the metadata's declared ordering.
    fn step(&mut self, observation: &[f64], carry: Carry) -> (Vec<f64>, Carry);

    fn metadata(&self) -> &PolicyMetadata;
}

/// Echoes zero actions of the declared joint count. Lets the control loop
/// run end-to-end without a real ONNX runtime.
pub struct DummyPolicyRuntime {
    metadata: PolicyMetadata,
}

impl DummyPolicyRuntime {
    pub fn new(metadata: PolicyMetadata) -> Self {
        DummyPolicyRuntime { metadata }
    }
}

impl PolicyRuntime for DummyPolicyRuntime {
    fn init(&mut self) -> Carry {
        Carry(Vec::new())
    }

    fn step(&mut self, _observation: &[f64], carry: Carry) -> (Vec<f64>, Carry) {
        (vec![0.0; self.metadata.joint_names.len()], carry)
    }

    fn metadata(&self) -> &PolicyMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_archive(bytes_out: &mut Vec<u8>, metadata_json: &[u8]) {
        let encoder = flate2::write::GzEncoder::new(bytes_out, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut append = |name: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        };
        append("init_fn.onnx", b"init-bytes");
        append("step_fn.onnx", b"step-bytes");
        append("metadata.json", metadata_json);
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn loads_a_well_formed_archive() {
        let metadata = br#"{"joint_names": ["dof_left_elbow_02"], "command_names": ["vx"]}"#;
        let mut bytes = Vec::new();
        build_archive(&mut bytes, metadata);

        let dir = std::env::temp_dir().join(format!("kinfer-policy-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.kinfer");
        std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

        let archive = PolicyArchive::load(&path).unwrap();
        assert_eq!(archive.init_fn, b"init-bytes");
        assert_eq!(archive.metadata.joint_names, vec!["dof_left_elbow_02"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_a_path_without_the_kinfer_extension() {
        let err = PolicyArchive::load("/tmp/model.tar.gz").unwrap_err();
        assert!(matches!(err, FirmwareError::ArchiveInvalid(_)));
    }

    #[test]
    fn dummy_runtime_echoes_zero_actions_of_the_right_length() {
        let metadata = PolicyMetadata {
            joint_names: vec!["a".into(), "b".into(), "c".into()],
            command_names: vec![],
            joint_biases: vec![],
        };
        let mut runtime = DummyPolicyRuntime::new(metadata);
        let carry = runtime.init();
        let (action, _) = runtime.step(&[0.0; 3], carry);
        assert_eq!(action, vec![0.0, 0.0, 0.0]);
    }
}
