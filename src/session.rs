use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::mpsc;

use crate::actions::Actions;
use crate::error::MilterError;
use crate::handler::{Milter, Properties};
use crate::negotiate::{negotiate, Negotiated};
use crate::status::Status;
use crate::wire::{
    Packet, SMFIC_BODYEOB, SMFIC_CONNECT, SMFIC_DATA, SMFIC_EOH, SMFIC_HELO, SMFIC_MAIL,
    SMFIC_RCPT, SMFIC_UNKNOWN, SMFIP_NOCONNECT, SMFIP_NOEOH, SMFIP_NOMAIL, SMFIP_NORCPT,
    SMFIP_NR_BODY, SMFIP_NR_CONN, SMFIP_NR_DATA, SMFIP_NR_EOH, SMFIP_NR_HDR, SMFIP_NR_HELO,
    SMFIP_NR_MAIL, SMFIP_NR_RCPT, SMFIP_NR_UNKN, SMFIP_SKIP, SMFIR_CONTINUE,
};

/// One decoded MTA command, as handed over by the transport. The
/// transport owns the length-prefixed framing; the session only sees the
/// structured form.
#[derive(Debug, Clone)]
pub enum Command {
    /// Option negotiation. Always the first command on a connection.
    OptNeg {
        version: u32,
        action_flags: u32,
        protocol_flags: u32,
    },
    /// Macro definitions for the phase announced by `cmd` (a `SMFIC_`
    /// byte).
    Macro { cmd: u8, defs: Vec<(String, String)> },
    Connect {
        hostname: String,
        hostaddr: Option<IpAddr>,
    },
    Helo { helohost: String },
    Mail { argv: Vec<Vec<u8>> },
    Rcpt { argv: Vec<Vec<u8>> },
    Data,
    Header { name: Vec<u8>, value: Vec<u8> },
    Eoh,
    Body { chunk: Vec<u8> },
    /// Final body chunk: end of message.
    BodyEob,
    Abort,
    Unknown { command: Vec<u8> },
    Quit,
    /// Quit, but a new connection follows on the reused object.
    QuitNc,
}

/// Position inside a message cycle. `Eom` is only ever a transition
/// target; after end-of-message the session is back at `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgState {
    None,
    Mail,
    Rcpt,
    Data,
    Header,
    Eoh,
    Body,
    Eom,
}

impl MsgState {
    fn ord(self) -> u8 {
        match self {
            MsgState::None => 0,
            MsgState::Mail => 1,
            MsgState::Rcpt => 2,
            MsgState::Data => 3,
            MsgState::Header => 4,
            MsgState::Eoh => 5,
            MsgState::Body => 6,
            MsgState::Eom => 7,
        }
    }

    // RCPT, HEADER and BODY may repeat in place.
    fn repeatable(self) -> bool {
        matches!(self, MsgState::Rcpt | MsgState::Header | MsgState::Body)
    }
}

// Phases a cycle cannot silently jump over, with the NO_* flag that
// excuses their absence.
const MANDATORY: [(MsgState, u32); 3] = [
    (MsgState::Mail, SMFIP_NOMAIL),
    (MsgState::Rcpt, SMFIP_NORCPT),
    (MsgState::Eoh, SMFIP_NOEOH),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Connection,
    Message,
    Recipient,
}

/// The per-connection milter state machine.
///
/// The transport feeds it decoded [`Command`]s in arrival order; each
/// call returns the packets to write back, possibly none. Commands for
/// one session must be processed sequentially. Illegal commands fail
/// with [`MilterError::ProtocolViolation`] without reaching the handler;
/// handler errors are absorbed as TEMPFAIL at the current scope.
pub struct Session<M: Milter> {
    milter: M,
    negotiated: Option<Negotiated>,

    connected: bool,
    helo_count: u32,
    msg: MsgState,

    // Connection-scope terminal disposition was given; remaining phases
    // are answered without the handler.
    bypass: bool,
    // Message-scope terminal disposition was given for the current cycle.
    msg_done: bool,
    skip_body: bool,

    closed: bool,
    close_called: bool,

    macros: HashMap<u8, Properties>,
    progress_sink: Option<mpsc::UnboundedSender<Packet>>,
}

impl<M: Milter> Session<M> {
    pub fn new(milter: M) -> Self {
        Session {
            milter,
            negotiated: None,
            connected: false,
            helo_count: 0,
            msg: MsgState::None,
            bypass: false,
            msg_done: false,
            skip_body: false,
            closed: false,
            close_called: false,
            macros: HashMap::new(),
            progress_sink: None,
        }
    }

    /// Install a channel that `Actions::progress` forwards through
    /// immediately, so the transport can relay keep-alives while an EOM
    /// callback is still running.
    pub fn set_progress_sink(&mut self, sink: mpsc::UnboundedSender<Packet>) {
        self.progress_sink = Some(sink);
    }

    /// The negotiation outcome, once OPTNEG has been processed.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// True once the session reached its terminal state and the
    /// transport should drop the connection.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feed one command through the state machine.
    pub async fn process(&mut self, cmd: Command) -> Result<Vec<Packet>, MilterError> {
        if self.closed {
            return Err(MilterError::Closed);
        }

        match cmd {
            Command::OptNeg {
                version,
                action_flags,
                protocol_flags,
            } => self.handle_optneg(version, action_flags, protocol_flags),
            Command::Macro { cmd, defs } => {
                self.require_negotiated("MACRO")?;
                self.macros.insert(cmd, defs.into_iter().collect());
                Ok(Vec::new())
            }
            Command::Connect { hostname, hostaddr } => {
                self.handle_connect(hostname, hostaddr).await
            }
            Command::Helo { helohost } => self.handle_helo(helohost).await,
            Command::Mail { argv } => self.handle_mail(argv).await,
            Command::Rcpt { argv } => self.handle_rcpt(argv).await,
            Command::Data => self.handle_data().await,
            Command::Header { name, value } => self.handle_header(name, value).await,
            Command::Eoh => self.handle_eoh().await,
            Command::Body { chunk } => self.handle_body(chunk).await,
            Command::BodyEob => self.handle_eom().await,
            Command::Abort => self.handle_abort().await,
            Command::Unknown { command } => self.handle_unknown(command).await,
            Command::Quit => {
                self.close().await;
                Ok(Vec::new())
            }
            Command::QuitNc => self.handle_quit_nc(),
        }
    }

    /// The transport lost the connection: implicit abort of any message
    /// in flight, then close. Safe to call in any state.
    pub async fn disconnected(&mut self) {
        if self.msg != MsgState::None && !self.close_called {
            if let Err(err) = self.milter.abort().await {
                log::warn!("abort handler failed during disconnect: {}", err);
            }
            self.end_cycle();
        }
        self.close().await;
    }

    /// Invoke the handler's close callback. Idempotent; `QUIT` routes
    /// through here, and the transport calls it for abnormal endings.
    pub async fn close(&mut self) {
        self.closed = true;
        if self.close_called {
            return;
        }
        self.close_called = true;
        if let Err(err) = self.milter.close().await {
            log::warn!("close handler failed: {}", err);
        }
    }

    fn handle_optneg(
        &mut self,
        mta_version: u32,
        mta_action_flags: u32,
        mta_protocol_flags: u32,
    ) -> Result<Vec<Packet>, MilterError> {
        if self.negotiated.is_some() {
            return Err(self.violation("OPTNEG"));
        }

        match negotiate(
            &mut self.milter,
            mta_version,
            mta_action_flags,
            mta_protocol_flags,
        ) {
            Ok(negotiated) => {
                let packet = negotiated.packet();
                self.negotiated = Some(negotiated);
                Ok(vec![packet])
            }
            Err(err) => {
                // Fatal to the connection: tempfail, then the transport
                // closes. Never retried on this connection attempt.
                log::warn!("negotiation failed: {}", err);
                self.bypass = true;
                self.closed = true;
                Ok(vec![Status::Tempfail.packet().unwrap()])
            }
        }
    }

    async fn handle_connect(
        &mut self,
        hostname: String,
        hostaddr: Option<IpAddr>,
    ) -> Result<Vec<Packet>, MilterError> {
        self.require_negotiated("CONNECT")?;
        if self.connected {
            // CONNECT fires exactly once per connection.
            return Err(self.violation("CONNECT"));
        }
        self.connected = true;

        if self.bypass {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let props = self.props(SMFIC_CONNECT);
        let status = self.milter.connect(&hostname, hostaddr, &props).await;
        Ok(self.respond(status, Scope::Connection, SMFIP_NR_CONN))
    }

    async fn handle_helo(&mut self, helohost: String) -> Result<Vec<Packet>, MilterError> {
        self.require_connected("HELO")?;
        if self.msg != MsgState::None {
            return Err(self.violation("HELO"));
        }
        if self.helo_count >= 3 {
            // Clients may re-issue HELO/EHLO, but not endlessly.
            return Err(self.violation("HELO"));
        }
        self.helo_count += 1;

        if self.bypass {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let props = self.props(SMFIC_HELO);
        let status = self.milter.helo(&helohost, &props).await;
        Ok(self.respond(status, Scope::Connection, SMFIP_NR_HELO))
    }

    async fn handle_mail(&mut self, argv: Vec<Vec<u8>>) -> Result<Vec<Packet>, MilterError> {
        self.require_connected("MAIL")?;
        self.enter(MsgState::Mail, "MAIL")?;
        self.msg_done = false;
        self.skip_body = false;

        if self.skipping_message() {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let props = self.props(SMFIC_MAIL);
        let status = self.milter.envfrom(&argv, &props).await;
        Ok(self.respond(status, Scope::Message, SMFIP_NR_MAIL))
    }

    async fn handle_rcpt(&mut self, argv: Vec<Vec<u8>>) -> Result<Vec<Packet>, MilterError> {
        self.require_connected("RCPT")?;
        self.enter(MsgState::Rcpt, "RCPT")?;

        if self.skipping_message() {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let props = self.props(SMFIC_RCPT);
        let status = self.milter.envrcpt(&argv, &props).await;
        Ok(self.respond(status, Scope::Recipient, SMFIP_NR_RCPT))
    }

    async fn handle_data(&mut self) -> Result<Vec<Packet>, MilterError> {
        self.require_connected("DATA")?;
        self.enter(MsgState::Data, "DATA")?;

        if self.skipping_message() {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let props = self.props(SMFIC_DATA);
        let status = self.milter.data(&props).await;
        Ok(self.respond(status, Scope::Message, SMFIP_NR_DATA))
    }

    async fn handle_header(
        &mut self,
        name: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Vec<Packet>, MilterError> {
        self.require_connected("HEADER")?;
        self.enter(MsgState::Header, "HEADER")?;

        if self.skipping_message() {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let status = self.milter.header(&name, &value).await;
        Ok(self.respond(status, Scope::Message, SMFIP_NR_HDR))
    }

    async fn handle_eoh(&mut self) -> Result<Vec<Packet>, MilterError> {
        self.require_connected("EOH")?;
        self.enter(MsgState::Eoh, "EOH")?;

        if self.skipping_message() {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let allowed = self.negotiated.as_ref().map_or(0, |n| n.action_flags);
        let props = self.props(SMFIC_EOH);
        let mut actions = Actions::new(allowed, self.progress_sink.clone());
        let status = self.milter.eoh(&mut actions, &props).await;

        let mut packets = match &status {
            Ok(_) => actions.take_packets(),
            // A failed callback forfeits its buffered mutations.
            Err(_) => Vec::new(),
        };
        let status = match actions.take_finished() {
            Some(final_status) => Ok(final_status),
            None => status,
        };
        packets.extend(self.respond(status, Scope::Message, SMFIP_NR_EOH));
        Ok(packets)
    }

    async fn handle_body(&mut self, chunk: Vec<u8>) -> Result<Vec<Packet>, MilterError> {
        self.require_connected("BODY")?;
        self.enter(MsgState::Body, "BODY")?;

        if self.skipping_message() || self.skip_body {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let status = self.milter.body(&chunk).await;

        if let Ok(Status::Skip) = status {
            let mta_skips = self
                .negotiated
                .as_ref()
                .map_or(false, |n| n.protocol_flags & SMFIP_SKIP != 0);
            self.skip_body = true;
            if mta_skips {
                return Ok(vec![Status::Skip.packet().unwrap()]);
            }
            // The MTA keeps sending chunks; the session just stops
            // delivering them.
            log::debug!("MTA lacks SMFIP_SKIP, answering CONTINUE and dropping body chunks");
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        Ok(self.respond(status, Scope::Message, SMFIP_NR_BODY))
    }

    async fn handle_eom(&mut self) -> Result<Vec<Packet>, MilterError> {
        self.require_connected("BODYEOB")?;
        self.enter(MsgState::Eom, "BODYEOB")?;

        if self.skipping_message() {
            self.end_cycle();
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let allowed = self.negotiated.as_ref().map_or(0, |n| n.action_flags);
        let props = self.props(SMFIC_BODYEOB);
        let mut actions = Actions::new(allowed, self.progress_sink.clone());
        let status = self.milter.eom(&mut actions, &props).await;

        let mut packets = match &status {
            Ok(_) => actions.take_packets(),
            Err(_) => Vec::new(),
        };
        let status = match actions.take_finished() {
            Some(final_status) => Ok(final_status),
            None => status,
        };
        // EOM always gets a wire reply; there is no NR flag for it.
        packets.extend(self.respond(status, Scope::Message, 0));
        self.end_cycle();
        Ok(packets)
    }

    async fn handle_abort(&mut self) -> Result<Vec<Packet>, MilterError> {
        self.require_negotiated("ABORT")?;
        // ABORT outside a message cycle is tolerated as a no-op.
        if self.msg != MsgState::None {
            if !self.bypass {
                if let Err(err) = self.milter.abort().await {
                    log::warn!("abort handler failed: {}", err);
                }
            }
            self.end_cycle();
        }
        Ok(Vec::new())
    }

    async fn handle_unknown(&mut self, command: Vec<u8>) -> Result<Vec<Packet>, MilterError> {
        self.require_negotiated("UNKNOWN")?;

        // UNKNOWN interleaves anywhere and never advances the state.
        if self.bypass || self.msg_done {
            return Ok(vec![Packet::new(SMFIR_CONTINUE)]);
        }

        let props = self.props(SMFIC_UNKNOWN);
        let status = self.milter.unknown(&command, &props).await;
        Ok(self.respond(status, Scope::Message, SMFIP_NR_UNKN))
    }

    fn handle_quit_nc(&mut self) -> Result<Vec<Packet>, MilterError> {
        self.require_negotiated("QUIT_NC")?;

        // The connection object is reused: transaction state rewinds to
        // just after negotiation, capabilities and macro table stay.
        self.milter.reset();
        self.connected = false;
        self.helo_count = 0;
        self.bypass = false;
        self.msg = MsgState::None;
        self.msg_done = false;
        self.skip_body = false;
        self.macros.clear();
        Ok(Vec::new())
    }

    fn require_negotiated(&self, command: &'static str) -> Result<(), MilterError> {
        if self.negotiated.is_none() {
            return Err(self.violation(command));
        }
        Ok(())
    }

    fn require_connected(&self, command: &'static str) -> Result<(), MilterError> {
        self.require_negotiated(command)?;
        if !self.connected && !self.wants_skipped(SMFIP_NOCONNECT) {
            return Err(self.violation(command));
        }
        Ok(())
    }

    fn wants_skipped(&self, flag: u32) -> bool {
        self.negotiated
            .as_ref()
            .map_or(false, |n| n.protocol_flags & flag != 0)
    }

    /// Move the message cycle to `target`, or fail if the ordering rules
    /// forbid it. A mandatory phase may only be jumped over when its
    /// NO_* flag was negotiated.
    fn enter(&mut self, target: MsgState, command: &'static str) -> Result<(), MilterError> {
        let cur = self.msg.ord();
        let tgt = target.ord();

        if cur > tgt || (cur == tgt && !target.repeatable()) {
            return Err(self.violation(command));
        }
        if cur < tgt {
            for (phase, flag) in MANDATORY {
                if cur < phase.ord() && phase.ord() < tgt && !self.wants_skipped(flag) {
                    return Err(self.violation(command));
                }
            }
        }
        self.msg = target;
        Ok(())
    }

    fn violation(&self, command: &'static str) -> MilterError {
        MilterError::ProtocolViolation {
            command,
            state: format!(
                "{:?} (negotiated={}, connected={})",
                self.msg,
                self.negotiated.is_some(),
                self.connected
            ),
        }
    }

    fn skipping_message(&self) -> bool {
        self.bypass || self.msg_done
    }

    fn props(&self, cmd: u8) -> Properties {
        self.macros.get(&cmd).cloned().unwrap_or_default()
    }

    fn end_cycle(&mut self) {
        self.msg = MsgState::None;
        self.msg_done = false;
        self.skip_body = false;
        // Connection-scoped macros survive; message-scoped ones do not.
        self.macros
            .retain(|cmd, _| matches!(*cmd, SMFIC_CONNECT | SMFIC_HELO));
    }

    /// Map a handler result to wire packets and record its effect on the
    /// session, honoring the scope of the current phase.
    fn respond(
        &mut self,
        status: anyhow::Result<Status>,
        scope: Scope,
        nr_flag: u32,
    ) -> Vec<Packet> {
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                // A failing handler is a temporary failure at the current
                // scope, never a crash of the session loop.
                log::warn!("handler callback failed: {}", err);
                Status::Tempfail
            }
        };

        let status = match status {
            Status::Skip => {
                log::warn!("SKIP returned outside a body callback, treating as CONTINUE");
                Status::Continue
            }
            Status::Discard if scope == Scope::Connection => {
                log::warn!("DISCARD returned from a connection-scoped phase, treating as TEMPFAIL");
                Status::Tempfail
            }
            other => other,
        };

        if let Status::Noreply = status {
            let negotiated = self.negotiated.as_ref();
            let supported = nr_flag != 0
                && negotiated.map_or(false, |n| n.protocol_flags & nr_flag != 0);
            let emulated = nr_flag != 0
                && negotiated.map_or(false, |n| n.emulated_noreply & nr_flag != 0);
            if supported {
                return Vec::new();
            }
            if !emulated {
                log::warn!("NOREPLY returned without its negotiated NR flag, sending CONTINUE");
            }
            return vec![Packet::new(SMFIR_CONTINUE)];
        }

        let terminal = match &status {
            Status::Continue => false,
            Status::Accept | Status::Reject | Status::Discard | Status::Tempfail => true,
            // 2xx replies let processing continue; 4xx/5xx end the scope.
            Status::ReplyCode(text) => !text.starts_with(b"2"),
            Status::Skip | Status::Noreply => false,
        };

        if terminal {
            match scope {
                Scope::Connection => self.bypass = true,
                Scope::Message => self.msg_done = true,
                Scope::Recipient => {
                    // Only this recipient is affected, except DISCARD,
                    // which always drops the whole message.
                    if status == Status::Discard {
                        self.msg_done = true;
                    }
                }
            }
        }

        match status.packet() {
            Some(packet) => vec![packet],
            None => Vec::new(),
        }
    }
}
