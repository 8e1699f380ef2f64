//! Control sub-protocol — session-management opcodes
//!
//! A small fixed vocabulary exchanged exclusively over the control adapter.
//! Control messages use their own compact framing, never the data path's
//! packet ids: 1-byte opcode, 2-byte big-endian adapter id, and for `Priv` a
//! 2-byte sub-type plus a 4-byte length-prefixed payload carrying transport
//! handoff metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Upper bound on a Priv payload, from the control channel's receive buffer
pub const CONTROL_PAYLOAD_LIMIT: usize = 512;

/// Control opcode wire values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlOpcode {
    Connect = 1,
    Sleep = 2,
    Wakeup = 3,
    Disconnect = 4,
    Priv = 10,
    DisconnectAck = 24,
}

impl ControlOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ControlOpcode::Connect),
            2 => Some(ControlOpcode::Sleep),
            3 => Some(ControlOpcode::Wakeup),
            4 => Some(ControlOpcode::Disconnect),
            10 => Some(ControlOpcode::Priv),
            24 => Some(ControlOpcode::DisconnectAck),
            _ => None,
        }
    }
}

impl fmt::Display for ControlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlOpcode::Connect => write!(f, "Connect"),
            ControlOpcode::Sleep => write!(f, "Sleep"),
            ControlOpcode::Wakeup => write!(f, "Wakeup"),
            ControlOpcode::Disconnect => write!(f, "Disconnect"),
            ControlOpcode::Priv => write!(f, "Priv"),
            ControlOpcode::DisconnectAck => write!(f, "DisconnectAck"),
        }
    }
}

/// Priv sub-type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivType {
    /// Transport-specific rendezvous information for a data adapter
    TransportHandoff,
    /// Delivery acknowledgement for a data packet, carrying the packet id
    DeliveryAck,
    /// Reserved sentinel for unrecognized sub-types
    Unknown,
}

impl PrivType {
    pub fn value(&self) -> u16 {
        match self {
            PrivType::TransportHandoff => 1,
            PrivType::DeliveryAck => 2,
            PrivType::Unknown => 999,
        }
    }

    /// Unrecognized tags decode to [`PrivType::Unknown`] so newer peers can
    /// ship sub-types this version does not understand.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => PrivType::TransportHandoff,
            2 => PrivType::DeliveryAck,
            _ => PrivType::Unknown,
        }
    }
}

/// Errors for control message encoding/decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("Truncated control message: {got} bytes, {want} required")]
    Truncated { got: usize, want: usize },

    #[error("Unknown control opcode: {0}")]
    UnknownOpcode(u8),

    #[error("Priv payload too large: {0} bytes (max {CONTROL_PAYLOAD_LIMIT})")]
    OversizedPayload(usize),
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Ask the peer to bring the named data adapter up
    Connect { adapter_id: u16 },
    /// Pause data flow on the named adapter without tearing it down
    Sleep { adapter_id: u16 },
    /// Resume data flow on the named adapter
    Wakeup { adapter_id: u16 },
    /// Graceful session teardown request
    Disconnect { adapter_id: u16 },
    /// Acknowledgement of a Disconnect
    DisconnectAck { adapter_id: u16 },
    /// Typed handoff payload for a data adapter
    Priv {
        adapter_id: u16,
        priv_type: PrivType,
        payload: Vec<u8>,
    },
}

impl ControlMessage {
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlMessage::Connect { .. } => ControlOpcode::Connect,
            ControlMessage::Sleep { .. } => ControlOpcode::Sleep,
            ControlMessage::Wakeup { .. } => ControlOpcode::Wakeup,
            ControlMessage::Disconnect { .. } => ControlOpcode::Disconnect,
            ControlMessage::DisconnectAck { .. } => ControlOpcode::DisconnectAck,
            ControlMessage::Priv { .. } => ControlOpcode::Priv,
        }
    }

    pub fn adapter_id(&self) -> u16 {
        match self {
            ControlMessage::Connect { adapter_id }
            | ControlMessage::Sleep { adapter_id }
            | ControlMessage::Wakeup { adapter_id }
            | ControlMessage::Disconnect { adapter_id }
            | ControlMessage::DisconnectAck { adapter_id }
            | ControlMessage::Priv { adapter_id, .. } => *adapter_id,
        }
    }

    /// Encode to the control channel framing
    pub fn encode(&self) -> Result<Vec<u8>, ControlError> {
        let mut out = Vec::with_capacity(3);
        out.push(self.opcode() as u8);
        out.extend_from_slice(&self.adapter_id().to_be_bytes());

        if let ControlMessage::Priv {
            priv_type, payload, ..
        } = self
        {
            if payload.len() > CONTROL_PAYLOAD_LIMIT {
                return Err(ControlError::OversizedPayload(payload.len()));
            }
            out.extend_from_slice(&priv_type.value().to_be_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(payload);
        }
        Ok(out)
    }

    /// Decode one control message from a whole control-channel frame
    pub fn decode(bytes: &[u8]) -> Result<ControlMessage, ControlError> {
        if bytes.len() < 3 {
            return Err(ControlError::Truncated {
                got: bytes.len(),
                want: 3,
            });
        }
        let opcode =
            ControlOpcode::from_u8(bytes[0]).ok_or(ControlError::UnknownOpcode(bytes[0]))?;
        let adapter_id = u16::from_be_bytes([bytes[1], bytes[2]]);

        match opcode {
            ControlOpcode::Connect => Ok(ControlMessage::Connect { adapter_id }),
            ControlOpcode::Sleep => Ok(ControlMessage::Sleep { adapter_id }),
            ControlOpcode::Wakeup => Ok(ControlMessage::Wakeup { adapter_id }),
            ControlOpcode::Disconnect => Ok(ControlMessage::Disconnect { adapter_id }),
            ControlOpcode::DisconnectAck => Ok(ControlMessage::DisconnectAck { adapter_id }),
            ControlOpcode::Priv => {
                if bytes.len() < 9 {
                    return Err(ControlError::Truncated {
                        got: bytes.len(),
                        want: 9,
                    });
                }
                let priv_type = PrivType::from_u16(u16::from_be_bytes([bytes[3], bytes[4]]));
                let len =
                    u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
                if len > CONTROL_PAYLOAD_LIMIT {
                    return Err(ControlError::OversizedPayload(len));
                }
                if bytes.len() < 9 + len {
                    return Err(ControlError::Truncated {
                        got: bytes.len(),
                        want: 9 + len,
                    });
                }
                Ok(ControlMessage::Priv {
                    adapter_id,
                    priv_type,
                    payload: bytes[9..9 + len].to_vec(),
                })
            }
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Priv {
                adapter_id,
                priv_type,
                payload,
            } => write!(
                f,
                "Priv {{ adapter: {}, sub_type: {}, payload_len: {} }}",
                adapter_id,
                priv_type.value(),
                payload.len()
            ),
            other => write!(f, "{} {{ adapter: {} }}", other.opcode(), other.adapter_id()),
        }
    }
}
