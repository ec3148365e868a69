//! Builder for REAPI Action

use crate::mapper::command::MappedCommand;
use crate::merkle::Digest;
use crate::reapi::Action as ReapiAction;
use bytes::Bytes;
use prost::Message;
use std::time::Duration;

/// Result of building an action
#[derive(Debug, Clone)]
pub struct MappedAction {
    /// The REAPI Action proto
    pub action: ReapiAction,
    /// Serialized bytes of the action
    pub action_bytes: Bytes,
    /// Digest of the serialized action; the cache key
    pub action_digest: Digest,
}

/// Builder for constructing REAPI Actions
pub struct ActionBuilder;

impl ActionBuilder {
    /// Build an Action from a MappedCommand and input root digest
    ///
    /// The Action references the command digest and the input root digest;
    /// both must be in the CAS before the action result is published.
    pub fn build_action(
        mapped_command: &MappedCommand,
        input_root_digest: &Digest,
        timeout: Option<Duration>,
        do_not_cache: bool,
    ) -> MappedAction {
        let timeout = timeout.map(|t| prost_types::Duration {
            seconds: i64::try_from(t.as_secs()).unwrap_or(i64::MAX),
            nanos: i32::try_from(t.subsec_nanos()).unwrap_or(0),
        });

        let action = ReapiAction {
            command_digest: Some(mapped_command.command_digest.to_proto()),
            input_root_digest: Some(input_root_digest.to_proto()),
            timeout,
            do_not_cache,
            salt: Vec::new(),
        };

        let action_bytes = Bytes::from(action.encode_to_vec());
        let action_digest = Digest::from_bytes(&action_bytes);

        MappedAction {
            action,
            action_bytes,
            action_digest,
        }
    }
}
