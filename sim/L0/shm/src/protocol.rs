//! Command and reply codec.
//!
//! Commands travel as a `u32` wire tag plus a payload. The server decodes the
//! tag with [`CommandType::try_from`]; an unknown tag or a payload that does
//! not match its tag is answered with [`ReplyType::UnsupportedCommand`] or
//! [`ReplyType::InvalidArgument`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ShmError;

/// Client command wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum CommandType {
    /// Import a model file.
    LoadModel = 1,
    /// Ask for the packed generalized state of the first articulated body.
    RequestActualState = 2,
    /// Advance the simulation.
    StepForwardSimulation = 3,
    /// Release the region and stop the server.
    Shutdown = 4,
}

impl TryFrom<u32> for CommandType {
    type Error = ShmError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::LoadModel),
            2 => Ok(Self::RequestActualState),
            3 => Ok(Self::StepForwardSimulation),
            4 => Ok(Self::Shutdown),
            other => Err(ShmError::UnsupportedCommand(other)),
        }
    }
}

impl From<CommandType> for u32 {
    fn from(kind: CommandType) -> Self {
        kind as Self
    }
}

/// Server reply wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum ReplyType {
    /// The model was imported.
    ModelLoadingCompleted = 100,
    /// No loader accepted the model, or import failed.
    ModelLoadingFailed = 101,
    /// Q and U were written to the shared block.
    ActualStateUpdateCompleted = 102,
    /// There is no articulated body to report.
    ActualStateUpdateFailed = 103,
    /// The simulation advanced.
    StepForwardSimulationCompleted = 104,
    /// The command tag is unknown.
    UnsupportedCommand = 105,
    /// The payload does not fit the tag.
    InvalidArgument = 106,
}

/// Arguments of a command.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CommandPayload {
    /// No arguments.
    #[default]
    None,
    /// Arguments of [`CommandType::LoadModel`].
    LoadModel {
        /// Model file.
        path: String,
        /// Import as one articulated body rather than separate rigid bodies.
        use_multi_body: bool,
        /// Pin the root.
        use_fixed_base: bool,
    },
    /// Arguments of [`CommandType::StepForwardSimulation`].
    StepForwardSimulation {
        /// Step size.
        delta_time: f64,
    },
}

/// A command slot as stored in the shared block.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SharedMemoryCommand {
    /// Client sequence number, starting at 1.
    pub sequence: u64,
    /// Wire tag, see [`CommandType`].
    pub tag: u32,
    /// Arguments.
    pub payload: CommandPayload,
}

/// Typed client command.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ClientCommand {
    /// Import a model.
    LoadModel {
        /// Model file.
        path: String,
        /// Import as one articulated body.
        use_multi_body: bool,
        /// Pin the root.
        use_fixed_base: bool,
    },
    /// Request Q and U.
    RequestActualState,
    /// Advance by `delta_time` seconds.
    StepForwardSimulation {
        /// Step size.
        delta_time: f64,
    },
    /// Stop the server.
    Shutdown,
}

impl ClientCommand {
    /// Wire tag of this command.
    #[must_use]
    pub const fn kind(&self) -> CommandType {
        match self {
            Self::LoadModel { .. } => CommandType::LoadModel,
            Self::RequestActualState => CommandType::RequestActualState,
            Self::StepForwardSimulation { .. } => CommandType::StepForwardSimulation,
            Self::Shutdown => CommandType::Shutdown,
        }
    }

    /// Encode into a command slot.
    #[must_use]
    pub fn encode(self, sequence: u64) -> SharedMemoryCommand {
        let tag = u32::from(self.kind());
        let payload = match self {
            Self::LoadModel {
                path,
                use_multi_body,
                use_fixed_base,
            } => CommandPayload::LoadModel {
                path,
                use_multi_body,
                use_fixed_base,
            },
            Self::StepForwardSimulation { delta_time } => CommandPayload::StepForwardSimulation { delta_time },
            Self::RequestActualState | Self::Shutdown => CommandPayload::None,
        };
        SharedMemoryCommand { sequence, tag, payload }
    }
}

/// Why a slot could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Unknown tag.
    Unsupported(u32),
    /// Payload does not match the tag.
    InvalidArgument(CommandType),
}

impl SharedMemoryCommand {
    /// Decode the slot into a typed command.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for an unknown tag, a payload of the wrong
    /// shape, or a non-finite or negative step size.
    pub fn decode(&self) -> Result<ClientCommand, DecodeError> {
        let kind = CommandType::try_from(self.tag).map_err(|_| DecodeError::Unsupported(self.tag))?;
        match (kind, &self.payload) {
            (
                CommandType::LoadModel,
                CommandPayload::LoadModel {
                    path,
                    use_multi_body,
                    use_fixed_base,
                },
            ) if !path.is_empty() => Ok(ClientCommand::LoadModel {
                path: path.clone(),
                use_multi_body: *use_multi_body,
                use_fixed_base: *use_fixed_base,
            }),
            (CommandType::RequestActualState, CommandPayload::None) => Ok(ClientCommand::RequestActualState),
            (CommandType::StepForwardSimulation, CommandPayload::StepForwardSimulation { delta_time })
                if delta_time.is_finite() && *delta_time >= 0.0 =>
            {
                Ok(ClientCommand::StepForwardSimulation {
                    delta_time: *delta_time,
                })
            }
            (CommandType::Shutdown, CommandPayload::None) => Ok(ClientCommand::Shutdown),
            (kind, _) => Err(DecodeError::InvalidArgument(kind)),
        }
    }
}

/// A reply slot.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServerReply {
    /// Sequence number of the command this answers.
    pub sequence: u64,
    /// Reply tag.
    pub kind: ReplyType,
    /// Number of valid entries in the block's Q array.
    pub num_dof_q: usize,
    /// Number of valid entries in the block's U array.
    pub num_dof_u: usize,
    /// Diagnostic for failure replies.
    pub message: Option<String>,
}

impl ServerReply {
    /// Reply without state or diagnostic.
    #[must_use]
    pub const fn new(sequence: u64, kind: ReplyType) -> Self {
        Self {
            sequence,
            kind,
            num_dof_q: 0,
            num_dof_u: 0,
            message: None,
        }
    }

    /// Failure reply with a diagnostic.
    #[must_use]
    pub fn failure(sequence: u64, kind: ReplyType, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(sequence, kind)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags() {
        for kind in [
            CommandType::LoadModel,
            CommandType::RequestActualState,
            CommandType::StepForwardSimulation,
            CommandType::Shutdown,
        ] {
            assert_eq!(CommandType::try_from(u32::from(kind)).unwrap(), kind);
        }
        assert!(matches!(CommandType::try_from(0), Err(ShmError::UnsupportedCommand(0))));
        assert!(CommandType::try_from(77).is_err());
    }

    #[test]
    fn test_decode_step() {
        let slot = ClientCommand::StepForwardSimulation { delta_time: 1.0 / 60.0 }.encode(3);
        assert_eq!(slot.sequence, 3);
        assert_eq!(slot.tag, 3);
        assert_eq!(
            slot.decode(),
            Ok(ClientCommand::StepForwardSimulation { delta_time: 1.0 / 60.0 })
        );
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        let slot = SharedMemoryCommand {
            sequence: 1,
            tag: u32::from(CommandType::StepForwardSimulation),
            payload: CommandPayload::None,
        };
        assert_eq!(
            slot.decode(),
            Err(DecodeError::InvalidArgument(CommandType::StepForwardSimulation))
        );

        let slot = ClientCommand::StepForwardSimulation { delta_time: f64::NAN }.encode(2);
        assert!(matches!(slot.decode(), Err(DecodeError::InvalidArgument(_))));

        let slot = ClientCommand::StepForwardSimulation { delta_time: -0.1 }.encode(2);
        assert!(slot.decode().is_err());

        let slot = ClientCommand::LoadModel {
            path: String::new(),
            use_multi_body: true,
            use_fixed_base: false,
        }
        .encode(4);
        assert_eq!(slot.decode(), Err(DecodeError::InvalidArgument(CommandType::LoadModel)));
    }

    #[test]
    fn test_decode_unknown_tag() {
        let slot = SharedMemoryCommand {
            sequence: 9,
            tag: 999,
            payload: CommandPayload::None,
        };
        assert_eq!(slot.decode(), Err(DecodeError::Unsupported(999)));
    }
}
