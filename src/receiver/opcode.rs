//! One-byte operation codes of the agent protocol.

use std::fmt;

use crate::core::{ApmError, Result};

/// Frame operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Agent to server: batch of metrics
    SendMetric = 0,
    /// Agent to server: batch of metrics, confirm each one
    SendMetricDirect = 1,
    /// Server to agent: token assigned to an FQN
    TokenAssign = 2,
    /// Server to agent: metric received
    Confirm = 3,
    /// Server to agent: forget all tokens
    Reset = 4,
    /// Agent to server: tokens forgotten
    ResetConfirm = 5,
}

impl OpCode {
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// True for codes an agent sends to the server
    pub fn is_inbound(self) -> bool {
        matches!(self, OpCode::SendMetric | OpCode::SendMetricDirect | OpCode::ResetConfirm)
    }

    /// True if each metric in the frame must be confirmed
    pub fn wants_confirm(self) -> bool {
        self == OpCode::SendMetricDirect
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ApmError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(OpCode::SendMetric),
            1 => Ok(OpCode::SendMetricDirect),
            2 => Ok(OpCode::TokenAssign),
            3 => Ok(OpCode::Confirm),
            4 => Ok(OpCode::Reset),
            5 => Ok(OpCode::ResetConfirm),
            other => Err(ApmError::protocol(format!("unknown opcode {}", other))),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::SendMetric => "SEND_METRIC",
            OpCode::SendMetricDirect => "SEND_METRIC_DIRECT",
            OpCode::TokenAssign => "TOKEN_ASSIGN",
            OpCode::Confirm => "CONFIRM",
            OpCode::Reset => "RESET",
            OpCode::ResetConfirm => "RESET_CONFIRM",
        };
        f.write_str(name)
    }
}
