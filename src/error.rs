//! Error types for the systolic GEMM engine

use std::fmt;

use thiserror::Error;

/// Result type for engine operations
pub type GemmResult<T> = Result<T, GemmError>;

/// Which side of a stream blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOp {
    Push,
    Pop,
}

impl fmt::Display for StreamOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOp::Push => write!(f, "push"),
            StreamOp::Pop => write!(f, "pop"),
        }
    }
}

/// Engine errors
#[derive(Debug, Error)]
pub enum GemmError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Tiling mismatch along {axis}: size is {got}, tiling factors give {expected}")]
    TilingMismatch {
        axis: char,
        expected: usize,
        got: usize,
    },

    #[error("Channel {channel} has depth {depth}, at least {required} is required")]
    InsufficientCapacity {
        channel: String,
        depth: usize,
        required: usize,
    },

    #[error("Shape mismatch for {operand}: expected {expected} elements, got {got}")]
    ShapeMismatch {
        operand: String,
        expected: usize,
        got: usize,
    },

    #[error("Miswired channel {channel}: {message}")]
    MiswiredChannel { channel: String, message: String },

    #[error("Pipeline stalled on {operation} of channel {channel}")]
    Stalled { channel: String, operation: StreamOp },

    #[error("Channel {channel} disconnected")]
    Disconnected { channel: String },

    #[error("Stage {stage} panicked")]
    StagePanicked { stage: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GemmError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        GemmError::InvalidConfig { message: msg.into() }
    }

    pub fn shape(operand: impl Into<String>, expected: usize, got: usize) -> Self {
        GemmError::ShapeMismatch {
            operand: operand.into(),
            expected,
            got,
        }
    }

    pub fn miswired(channel: impl fmt::Display, msg: impl Into<String>) -> Self {
        GemmError::MiswiredChannel {
            channel: channel.to_string(),
            message: msg.into(),
        }
    }

    /// Ranking used to pick the root cause out of several stage failures.
    ///
    /// A stall is where a deadlock was first observed; disconnections are
    /// the fallout of other stages bailing out.
    pub(crate) fn severity(&self) -> u8 {
        match self {
            GemmError::Stalled { .. } => 3,
            GemmError::StagePanicked { .. } => 2,
            GemmError::Disconnected { .. } => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = GemmError::TilingMismatch {
            axis: 'N',
            expected: 8,
            got: 6,
        };
        assert_eq!(
            err.to_string(),
            "Tiling mismatch along N: size is 6, tiling factors give 8"
        );

        let err = GemmError::Stalled {
            channel: "a_split[1]".to_string(),
            operation: StreamOp::Push,
        };
        assert_eq!(err.to_string(), "Pipeline stalled on push of channel a_split[1]");
    }

    #[test]
    fn test_severity_prefers_stalls() {
        let stalled = GemmError::Stalled {
            channel: "c_pipe[0][0]".to_string(),
            operation: StreamOp::Pop,
        };
        let gone = GemmError::Disconnected {
            channel: "c_pipe[1][0]".to_string(),
        };
        assert!(stalled.severity() > gone.severity());
    }
}
