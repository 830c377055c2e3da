use thiserror::Error;

/// Failure to turn a command into bytes or back
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Cannot encode command: {0}")]
    Encode(String),

    #[error("Cannot decode command: {0}")]
    Decode(String),

    /// Encoded size and the allowed maximum, both in bytes
    #[error("Command of {size} bytes is over the {max} byte limit")]
    CommandTooLarge { size: usize, max: usize },

    /// The peer sent a well-formed command this side never accepts
    #[error("Unexpected {0} command")]
    UnexpectedCommand(&'static str),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_limit_message_names_both_sizes() {
        let err = ProtocolError::CommandTooLarge {
            size: 70_000_000,
            max: 67_108_864,
        };
        assert_eq!(
            err.to_string(),
            "Command of 70000000 bytes is over the 67108864 byte limit"
        );
        assert_eq!(
            ProtocolError::UnexpectedCommand("SEND").to_string(),
            "Unexpected SEND command"
        );
    }
}
