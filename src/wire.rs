//! Milter wire identifiers and capability flags.
//!
//! Commands (MTA to filter) are prefixed with `SMFIC_`, reply actions
//! (filter to MTA) with `SMFIR_`. `SMFIF_` flags declare which mutation
//! actions a filter uses, `SMFIP_` flags which protocol steps it wants
//! suppressed or unreplied. The values are fixed by the milter protocol.

/// Connection information.
pub const SMFIC_CONNECT: u8 = b'C';
/// Define macro.
pub const SMFIC_MACRO: u8 = b'D';
/// HELO/EHLO.
pub const SMFIC_HELO: u8 = b'H';
/// MAIL FROM.
pub const SMFIC_MAIL: u8 = b'M';
/// RCPT TO.
pub const SMFIC_RCPT: u8 = b'R';
/// Final body chunk (end of message).
pub const SMFIC_BODYEOB: u8 = b'E';
/// Header.
pub const SMFIC_HEADER: u8 = b'L';
/// End of headers. The byte is guesswork inherited from the field; verify
/// against a live MTA before trusting it.
pub const SMFIC_EOH: u8 = b'N';
/// Option negotiation.
pub const SMFIC_OPTNEG: u8 = b'O';
/// QUIT.
pub const SMFIC_QUIT: u8 = b'Q';
/// QUIT, but a new connection follows on the same socket.
pub const SMFIC_QUIT_NC: u8 = b'K';
/// Body chunk.
pub const SMFIC_BODY: u8 = b'B';
/// DATA.
pub const SMFIC_DATA: u8 = b'T';
/// Abort the current message.
pub const SMFIC_ABORT: u8 = b'A';
/// Any unknown SMTP command.
pub const SMFIC_UNKNOWN: u8 = b'U';

/// Accept.
pub const SMFIR_ACCEPT: u8 = b'a';
/// Add or replace a header.
pub const SMFIR_ADDHEADER: u8 = b'h';
/// Insert a header without replacing.
pub const SMFIR_INSHEADER: u8 = b'i';
/// Set list of symbols (macros).
pub const SMFIR_SETSYMLIST: u8 = b'l';
/// Add recipient.
pub const SMFIR_ADDRCPT: u8 = b'+';
/// Add recipient including ESMTP args.
pub const SMFIR_ADDRCPT_PAR: u8 = b'2';
/// Change or delete a header.
pub const SMFIR_CHGHEADER: u8 = b'm';
/// Change the MAIL FROM value.
pub const SMFIR_CHGFROM: u8 = b'e';
/// Cause a connection failure.
pub const SMFIR_CONN_FAIL: u8 = b'f';
/// Continue with default operation, no changes.
pub const SMFIR_CONTINUE: u8 = b'c';
/// Remove recipient.
pub const SMFIR_DELRCPT: u8 = b'-';
/// Discard the message while pretending to accept it.
pub const SMFIR_DISCARD: u8 = b'd';
/// Operation still in progress; only sent from EOM during long operations.
pub const SMFIR_PROGRESS: u8 = b'p';
/// Quarantine the message; only sent from EOM.
pub const SMFIR_QUARANTINE: u8 = b'q';
/// Skip further BODY chunks and continue to EOM.
pub const SMFIR_SKIP: u8 = b's';
/// Reject.
pub const SMFIR_REJECT: u8 = b'r';
/// Replace body (chunk).
pub const SMFIR_REPLBODY: u8 = b'b';
/// Custom SMTP reply code.
pub const SMFIR_REPLYCODE: u8 = b'y';
/// Temporary failure, try again later.
pub const SMFIR_TEMPFAIL: u8 = b't';

/// Address family tag for IPv4 in CONNECT payloads.
pub const SMFIA_INET: u8 = b'4';
/// Address family tag for IPv6 in CONNECT payloads.
pub const SMFIA_INET6: u8 = b'6';

/// MTA should not send connect info.
pub const SMFIP_NOCONNECT: u32 = 0x0000_0001;
/// MTA should not send HELO/EHLO info.
pub const SMFIP_NOHELO: u32 = 0x0000_0002;
/// MTA should not send MAIL FROM info.
pub const SMFIP_NOMAIL: u32 = 0x0000_0004;
/// MTA should not send RCPT TO info.
pub const SMFIP_NORCPT: u32 = 0x0000_0008;
/// MTA should not send the body.
pub const SMFIP_NOBODY: u32 = 0x0000_0010;
/// MTA should not send headers.
pub const SMFIP_NOHDRS: u32 = 0x0000_0020;
/// MTA should not send end-of-headers.
pub const SMFIP_NOEOH: u32 = 0x0000_0040;
/// No reply expected for headers.
pub const SMFIP_NR_HDR: u32 = 0x0000_0080;
/// MTA should not send unknown commands.
pub const SMFIP_NOUNKNOWN: u32 = 0x0000_0100;
/// MTA should not send DATA.
pub const SMFIP_NODATA: u32 = 0x0000_0200;
/// MTA understands the SKIP reply to BODY chunks.
pub const SMFIP_SKIP: u32 = 0x0000_0400;
/// MTA should also send rejected RCPTs.
pub const SMFIP_RCPT_REJ: u32 = 0x0000_0800;
/// No reply expected for CONNECT.
pub const SMFIP_NR_CONN: u32 = 0x0000_1000;
/// No reply expected for HELO.
pub const SMFIP_NR_HELO: u32 = 0x0000_2000;
/// No reply expected for MAIL.
pub const SMFIP_NR_MAIL: u32 = 0x0000_4000;
/// No reply expected for RCPT.
pub const SMFIP_NR_RCPT: u32 = 0x0000_8000;
/// No reply expected for DATA.
pub const SMFIP_NR_DATA: u32 = 0x0001_0000;
/// No reply expected for UNKNOWN.
pub const SMFIP_NR_UNKN: u32 = 0x0002_0000;
/// No reply expected for end-of-headers.
pub const SMFIP_NR_EOH: u32 = 0x0004_0000;
/// No reply expected for body chunks.
pub const SMFIP_NR_BODY: u32 = 0x0008_0000;
/// Header values keep their leading space, and the MTA adds none to
/// headers the filter adds or replaces.
pub const SMFIP_HDR_LEADSPC: u32 = 0x0010_0000;

/// Every `SMFIP_NR_*` bit. The no-reply subfamily is soft during
/// negotiation: bits the MTA lacks are emulated, not fatal.
pub const SMFIP_NR_MASK: u32 = SMFIP_NR_CONN
    | SMFIP_NR_HELO
    | SMFIP_NR_MAIL
    | SMFIP_NR_RCPT
    | SMFIP_NR_DATA
    | SMFIP_NR_UNKN
    | SMFIP_NR_HDR
    | SMFIP_NR_EOH
    | SMFIP_NR_BODY;

/// Protocol version 1 flags.
pub const SMFI_V1_PROT: u32 = 0x0000_003F;
/// Protocol version 2 flags.
pub const SMFI_V2_PROT: u32 = 0x0000_007F;
/// All currently defined `SMFIP_` flags.
pub const SMFI_CURRENT_PROT: u32 = 0x001F_FFFF;

/// No modifications will be made.
pub const SMFIF_NONE: u32 = 0x0000_0000;
/// Headers may be added.
pub const SMFIF_ADDHDRS: u32 = 0x0000_0001;
/// The body may be changed.
pub const SMFIF_CHGBODY: u32 = 0x0000_0002;
/// Synonym of [`SMFIF_CHGBODY`].
pub const SMFIF_MODBODY: u32 = SMFIF_CHGBODY;
/// Recipients may be added.
pub const SMFIF_ADDRCPT: u32 = 0x0000_0004;
/// Recipients may be deleted.
pub const SMFIF_DELRCPT: u32 = 0x0000_0008;
/// Headers may be changed or deleted.
pub const SMFIF_CHGHDRS: u32 = 0x0000_0010;
/// The message may be quarantined.
pub const SMFIF_QUARANTINE: u32 = 0x0000_0020;
/// The envelope sender may be changed.
pub const SMFIF_CHGFROM: u32 = 0x0000_0040;
/// Recipients with ESMTP parameters may be added.
pub const SMFIF_ADDRCPT_PAR: u32 = 0x0000_0080;
/// The filter sends the set of symbols (macros) it wants.
pub const SMFIF_SETSYMLIST: u32 = 0x0000_0100;

/// Action flags available in protocol version 1.
pub const SMFI_V1_ACTS: u32 = 0x0000_000F;
/// Action flags available in protocol version 2.
pub const SMFI_V2_ACTS: u32 = 0x0000_003F;
/// All currently defined `SMFIF_` flags.
pub const SMFI_CURRENT_ACTS: u32 = 0x0000_01FF;

/// Oldest protocol version this engine negotiates.
pub const MIN_VERSION: u32 = 2;
/// Newest protocol version this engine negotiates.
pub const MAX_VERSION: u32 = 6;

/// One filter-to-MTA action, ready for the transport to frame and write.
///
/// The engine never touches the socket; it hands these to the transport
/// collaborator, which prepends the length and sends them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(code: u8) -> Self {
        Packet {
            code,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(code: u8, payload: Vec<u8>) -> Self {
        Packet { code, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nr_mask_covers_only_nr_bits() {
        assert_eq!(SMFIP_NR_MASK & SMFIP_NOCONNECT, 0);
        assert_eq!(SMFIP_NR_MASK & SMFIP_SKIP, 0);
        assert_ne!(SMFIP_NR_MASK & SMFIP_NR_HDR, 0);
        assert_ne!(SMFIP_NR_MASK & SMFIP_NR_BODY, 0);
        assert_eq!(SMFIP_NR_MASK & !SMFI_CURRENT_PROT, 0);
    }

    #[test]
    fn composite_action_masks() {
        assert_eq!(
            SMFI_V1_ACTS,
            SMFIF_ADDHDRS | SMFIF_CHGBODY | SMFIF_ADDRCPT | SMFIF_DELRCPT
        );
        assert_eq!(SMFI_V2_ACTS, SMFI_V1_ACTS | SMFIF_CHGHDRS | SMFIF_QUARANTINE);
        assert_eq!(
            SMFI_CURRENT_ACTS,
            SMFI_V2_ACTS | SMFIF_CHGFROM | SMFIF_ADDRCPT_PAR | SMFIF_SETSYMLIST
        );
    }
}
