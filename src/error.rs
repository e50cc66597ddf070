use thiserror::Error;

/// Errors surfaced by the milter engine.
///
/// Handler callback failures are not represented here: the session maps
/// them to a TEMPFAIL disposition at the current scope instead of
/// propagating them.
#[derive(Error, Debug)]
pub enum MilterError {
    /// Malformed reply-code construction, raised synchronously and never
    /// retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Capability mismatch between the handler and the MTA. Always fatal
    /// to the connection: the session answers the failed OPTNEG with
    /// TEMPFAIL and refuses everything after it.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The transport delivered a command that is illegal in the current
    /// session state. The connection must be failed, not the handler
    /// invoked with inconsistent state.
    #[error("protocol violation: {command} not legal in state {state}")]
    ProtocolViolation { command: &'static str, state: String },

    /// A mutation was requested without its negotiated action flag, or
    /// after `finish`.
    #[error("action refused: {0}")]
    ActionRefused(&'static str),

    /// A command arrived after the session reached its terminal state.
    #[error("session is closed")]
    Closed,
}
