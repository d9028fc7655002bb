use std::time::Duration;

use crate::{hello::HelloReply, sdam::ServerType};

/// Information about the server that a connection's handshake reported.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamDescription {
    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The supported authentication mechanisms for the user this connection authenticates as,
    /// from handshake-time mechanism negotiation.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// How long sessions started on this server will stay alive without further activity.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of a wire protocol message the server accepts or sends.
    pub(crate) max_message_size_bytes: i32,

    /// Whether the server understands the `hello` command name.
    pub(crate) hello_ok: bool,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a hello reply.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            sasl_supported_mechs: response.sasl_supported_mechs.clone(),
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            max_message_size_bytes: response.max_message_size_bytes,
            hello_ok: response.hello_ok.unwrap_or(false),
        }
    }

    /// Whether this server supports retryable writes: sessions plus wire version 8+.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.logical_session_timeout.is_some()
            && self.max_wire_version.map(|v| v >= 8).unwrap_or(false)
    }
}
