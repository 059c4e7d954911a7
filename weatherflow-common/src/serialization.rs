//! Wire encoding for feed frames.

use crate::error::{Error, Result};
use crate::message::{Command, Message};

/// Decode a text frame received from the feed.
pub fn decode_message(frame: &str) -> Result<Message> {
    serde_json::from_str(frame).map_err(|e| Error::InvalidMessage(e.to_string()))
}

/// Encode a listen command as a text frame.
pub fn encode_command(command: &Command) -> Result<String> {
    serde_json::to_string(command).map_err(Error::from)
}
