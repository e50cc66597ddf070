use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::actions::Actions;
use crate::macros::MacroRequests;
use crate::status::Status;
use crate::wire::{MAX_VERSION, SMFIF_NONE};

/// Macro definitions the MTA supplied for a phase, keyed by symbol name.
pub type Properties = HashMap<String, String>;

/// The contract a filter author implements.
///
/// Every callback has a default implementation returning
/// [`Status::Continue`], so a filter only overrides the phases it cares
/// about. Callbacks for one connection are invoked strictly in protocol
/// order and never concurrently; cross-connection state is the
/// implementor's own concern.
///
/// Returning an `Err` from a callback is treated as a temporary failure
/// at the current scope. The engine logs it and keeps the process alive.
#[async_trait]
pub trait Milter: Send {
    /// Start of an SMTP connection. Called exactly once per connection.
    ///
    /// `hostaddr` is `None` when the MTA connected over something other
    /// than an inet socket.
    async fn connect(
        &mut self,
        _hostname: &str,
        _hostaddr: Option<IpAddr>,
        _props: &Properties,
    ) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// HELO/EHLO. Clients may re-issue it; called zero to three times.
    async fn helo(&mut self, _helohost: &str, _props: &Properties) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// Envelope sender. Once per message, before any recipient. `argv[0]`
    /// is the sender address, later entries the ESMTP arguments.
    async fn envfrom(&mut self, _argv: &[Vec<u8>], _props: &Properties) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// Envelope recipient. One or more times per message. `argv[0]` is
    /// the recipient address.
    async fn envrcpt(&mut self, _argv: &[Vec<u8>], _props: &Properties) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// The DATA command, between the last recipient and the headers.
    async fn data(&mut self, _props: &Properties) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// One message header. The trailing CRLF is already stripped; the
    /// value may contain folded whitespace.
    async fn header(&mut self, _name: &[u8], _value: &[u8]) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// End of headers. Message mutations may be issued through `actions`.
    async fn eoh(&mut self, _actions: &mut Actions, _props: &Properties) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// One chunk of message body. Zero or more times per message.
    async fn body(&mut self, _chunk: &[u8]) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// End of message. The last word on the message; mutations and
    /// progress notifications go through `actions`.
    async fn eom(&mut self, _actions: &mut Actions, _props: &Properties) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// An SMTP command the MTA did not recognize. The command is rejected
    /// by the server either way; only the reply code can be influenced.
    async fn unknown(&mut self, _command: &[u8], _props: &Properties) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// The current message was aborted by the MTA. No reply is sent.
    async fn abort(&mut self) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// The connection is going away. Always called exactly once per
    /// connection, however it ended. No reply is sent.
    async fn close(&mut self) -> Result<Status> {
        Ok(Status::Continue)
    }

    /// Which mutation actions this filter will issue, as `SMFIF_` bits.
    fn action_flags(&self) -> u32 {
        // By default, modify nothing.
        SMFIF_NONE
    }

    /// Which phases this filter wants suppressed or unreplied, as
    /// `SMFIP_` bits.
    fn protocol_flags(&self) -> u32 {
        // By default, receive and reply to everything.
        0
    }

    /// Pick the protocol version, given what the MTA advertised. The
    /// result must lie in [`MIN_VERSION`](crate::wire::MIN_VERSION)..=
    /// [`MAX_VERSION`]; `action_flags`, `protocol_flags` and `macros` are
    /// read and verified right after this call.
    ///
    /// Flags should normally be constant, but this is the place to turn
    /// features off for an old MTA. Note the MTA may still deliver phases
    /// a filter opted out of; the callbacks run regardless.
    fn negotiate_version(
        &mut self,
        _mta_version: u32,
        _mta_action_flags: u32,
        _mta_protocol_flags: u32,
    ) -> u32 {
        MAX_VERSION
    }

    /// Forget all transaction state. Called when the MTA reuses the
    /// connection object for a new connection; the filter must end up in
    /// the state it was in right after negotiation.
    fn reset(&mut self) {}

    /// The symbols (macros) this filter wants per phase.
    fn macros(&self) -> MacroRequests {
        MacroRequests::new()
    }
}
