use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Minimum state needed to resume sampling after a restart.
///
/// The wire format is self-describing JSON; unknown fields are ignored on
/// read so older nodes can load checkpoints written by newer ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Height sampling resumes from. Every height before it was
    /// successfully sampled.
    pub sample_from: u64,
    /// Highest height seen on the network at the moment of capture.
    pub network_head: u64,
    /// Heights that finished sampling without success, with the amount of
    /// attempts per height.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub failed: HashMap<u64, u32>,
}

impl Checkpoint {
    pub(crate) fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> serde_json::Result<Checkpoint> {
        serde_json::from_slice(bytes)
    }
}

impl Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sample_from: {}, network_head: {}",
            self.sample_from, self.network_head
        )?;

        if !self.failed.is_empty() {
            write!(f, ", failed: {}", self.failed.len())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let checkpoint = Checkpoint {
            sample_from: 101,
            network_head: 120,
            failed: HashMap::from([(30, 2), (45, 1)]),
        };

        let bytes = checkpoint.encode().unwrap();
        assert_eq!(Checkpoint::decode(&bytes).unwrap(), checkpoint);
    }

    #[test]
    fn empty_failed_is_omitted() {
        let checkpoint = Checkpoint {
            sample_from: 1,
            network_head: 1,
            failed: HashMap::new(),
        };

        let json = String::from_utf8(checkpoint.encode().unwrap()).unwrap();
        assert!(!json.contains("failed"));
        assert_eq!(Checkpoint::decode(json.as_bytes()).unwrap(), checkpoint);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{
            "sample_from": 7,
            "network_head": 9,
            "failed": {"8": 3},
            "schema_version": 2
        }"#;

        let checkpoint = Checkpoint::decode(json.as_bytes()).unwrap();
        assert_eq!(checkpoint.sample_from, 7);
        assert_eq!(checkpoint.network_head, 9);
        assert_eq!(checkpoint.failed, HashMap::from([(8, 3)]));
    }
}
