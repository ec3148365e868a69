//! Mapper from a spawn to the REAPI Command

use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::reapi::{Command as ReapiCommand, command::EnvironmentVariable};
use crate::spawn::Spawn;
use bytes::Bytes;
use prost::Message;
use std::collections::BTreeSet;

/// Result of mapping a spawn to an REAPI Command
#[derive(Debug, Clone)]
pub struct MappedCommand {
    /// The REAPI Command proto
    pub command: ReapiCommand,
    /// Serialized bytes of the command
    pub command_bytes: Bytes,
    /// Digest of the serialized command
    pub command_digest: Digest,
}

/// Mapper for converting spawns to REAPI Commands
pub struct CommandMapper;

impl CommandMapper {
    /// Map a spawn to its canonical Command
    ///
    /// Environment variables and output paths are sorted so that equal spawns
    /// always serialize to the same bytes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a spawn without arguments or with an output
    /// path that is not valid UTF-8.
    pub fn map_spawn(spawn: &Spawn) -> Result<MappedCommand> {
        if spawn.arguments.is_empty() {
            return Err(RemoteError::config_error(format!(
                "spawn {:?} has no arguments",
                spawn.mnemonic
            )));
        }

        let environment_variables = spawn
            .environment
            .iter()
            .map(|(name, value)| EnvironmentVariable {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();

        let output_paths = Self::build_output_paths(spawn)?;

        let command = ReapiCommand {
            arguments: spawn.arguments.clone(),
            environment_variables,
            platform: None,
            working_directory: String::new(), // spawns run in the root of the input tree
            output_paths,
        };

        let command_bytes = Bytes::from(command.encode_to_vec());
        let command_digest = Digest::from_bytes(&command_bytes);

        Ok(MappedCommand {
            command,
            command_bytes,
            command_digest,
        })
    }

    fn build_output_paths(spawn: &Spawn) -> Result<Vec<String>> {
        let paths: BTreeSet<String> = spawn
            .outputs
            .iter()
            .map(|path| {
                path.to_str().map(str::to_string).ok_or_else(|| {
                    RemoteError::config_error(format!(
                        "output path {} is not valid UTF-8",
                        path.display()
                    ))
                })
            })
            .collect::<Result<_>>()?;
        Ok(paths.into_iter().collect())
    }
}
