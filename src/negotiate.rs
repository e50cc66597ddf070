//! Option negotiation: the one-time, two-sided capability handshake.
//!
//! The handler's declared capabilities are reconciled against what the
//! MTA advertised. True incompatibilities (actions or required protocol
//! steps the MTA lacks) fail the connection; missing no-reply support is
//! soft and gets emulated by the session with CONTINUE replies. A filter
//! should never have to behave differently depending on which MTA it
//! runs under.

use crate::error::MilterError;
use crate::handler::Milter;
use crate::macros::MacroRequests;
use crate::wire::{Packet, MAX_VERSION, MIN_VERSION, SMFIC_OPTNEG, SMFIP_NR_MASK};

/// Outcome of a successful negotiation, stored on the session for the
/// lifetime of the connection.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Effective protocol version.
    pub version: u32,
    /// Action flags the handler may use.
    pub action_flags: u32,
    /// Protocol flags actually requested from the MTA.
    pub protocol_flags: u32,
    /// `SMFIP_NR_*` bits the handler wants but the MTA lacks; the
    /// session answers CONTINUE at these phases on the handler's behalf.
    pub emulated_noreply: u32,
    /// The macro table, frozen for the connection.
    pub macros: MacroRequests,
}

impl Negotiated {
    /// The option-negotiation response: version and both flag words,
    /// big-endian, followed by the macro requests on protocol 6.
    pub fn packet(&self) -> Packet {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.version.to_be_bytes());
        payload.extend_from_slice(&self.action_flags.to_be_bytes());
        payload.extend_from_slice(&self.protocol_flags.to_be_bytes());
        if self.version >= 6 {
            payload.extend_from_slice(&self.macros.encode());
        }
        Packet::with_payload(SMFIC_OPTNEG, payload)
    }
}

/// Reconcile the handler's capabilities with the MTA's. Runs exactly
/// once per connection, before any transaction phase.
pub fn negotiate<M: Milter>(
    handler: &mut M,
    mta_version: u32,
    mta_action_flags: u32,
    mta_protocol_flags: u32,
) -> Result<Negotiated, MilterError> {
    let version = handler.negotiate_version(mta_version, mta_action_flags, mta_protocol_flags);

    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(MilterError::NegotiationFailed(format!(
            "handler picked protocol version {}, supported range is {}..={}",
            version, MIN_VERSION, MAX_VERSION
        )));
    }
    if version > mta_version {
        return Err(MilterError::NegotiationFailed(format!(
            "handler picked protocol version {}, MTA only speaks {}",
            version, mta_version
        )));
    }

    let action_flags = handler.action_flags();
    let unsupported_actions = action_flags & !mta_action_flags;
    if unsupported_actions != 0 {
        return Err(MilterError::NegotiationFailed(format!(
            "handler action flags {:#x} not offered by MTA ({:#x})",
            unsupported_actions, mta_action_flags
        )));
    }

    let protocol_flags = handler.protocol_flags();
    let required = protocol_flags & !SMFIP_NR_MASK;
    let unsupported_protocol = required & !mta_protocol_flags;
    if unsupported_protocol != 0 {
        return Err(MilterError::NegotiationFailed(format!(
            "handler protocol flags {:#x} not offered by MTA ({:#x})",
            unsupported_protocol, mta_protocol_flags
        )));
    }

    // NR bits the MTA lacks are not fatal: drop them from the request and
    // let the session answer CONTINUE itself.
    let emulated_noreply = protocol_flags & SMFIP_NR_MASK & !mta_protocol_flags;

    Ok(Negotiated {
        version,
        action_flags,
        protocol_flags: protocol_flags & mta_protocol_flags,
        emulated_noreply,
        macros: handler.macros(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::Stage;
    use crate::wire::{
        SMFIF_ADDHDRS, SMFIF_CHGHDRS, SMFIP_NR_HDR, SMFIP_SKIP, SMFI_CURRENT_ACTS,
        SMFI_CURRENT_PROT,
    };

    struct Flags {
        actions: u32,
        protocol: u32,
        version: u32,
    }

    impl Milter for Flags {
        fn action_flags(&self) -> u32 {
            self.actions
        }

        fn protocol_flags(&self) -> u32 {
            self.protocol
        }

        fn negotiate_version(&mut self, _v: u32, _a: u32, _p: u32) -> u32 {
            self.version
        }

        fn macros(&self) -> MacroRequests {
            MacroRequests::new().want(Stage::Connect, "j")
        }
    }

    #[test]
    fn unsupported_action_flag_is_fatal() {
        let mut handler = Flags {
            actions: SMFIF_ADDHDRS,
            protocol: 0,
            version: 6,
        };
        let err = negotiate(&mut handler, 6, 0, SMFI_CURRENT_PROT).unwrap_err();
        assert!(matches!(err, MilterError::NegotiationFailed(_)));
    }

    #[test]
    fn unsupported_required_protocol_flag_is_fatal() {
        let mut handler = Flags {
            actions: 0,
            protocol: SMFIP_SKIP,
            version: 6,
        };
        let err = negotiate(&mut handler, 6, SMFI_CURRENT_ACTS, 0).unwrap_err();
        assert!(matches!(err, MilterError::NegotiationFailed(_)));
    }

    #[test]
    fn unsupported_noreply_flag_is_emulated() {
        let mut handler = Flags {
            actions: 0,
            protocol: SMFIP_NR_HDR,
            version: 6,
        };
        let negotiated = negotiate(&mut handler, 6, SMFI_CURRENT_ACTS, 0).unwrap();
        assert_eq!(negotiated.emulated_noreply, SMFIP_NR_HDR);
        assert_eq!(negotiated.protocol_flags, 0);
    }

    #[test]
    fn supported_noreply_flag_passes_through() {
        let mut handler = Flags {
            actions: SMFIF_CHGHDRS,
            protocol: SMFIP_NR_HDR,
            version: 6,
        };
        let negotiated =
            negotiate(&mut handler, 6, SMFI_CURRENT_ACTS, SMFI_CURRENT_PROT).unwrap();
        assert_eq!(negotiated.emulated_noreply, 0);
        assert_eq!(negotiated.protocol_flags, SMFIP_NR_HDR);
        assert_eq!(negotiated.action_flags, SMFIF_CHGHDRS);
    }

    #[test]
    fn version_out_of_range_is_fatal() {
        for version in [0, 1, 7] {
            let mut handler = Flags {
                actions: 0,
                protocol: 0,
                version,
            };
            assert!(negotiate(&mut handler, 6, 0, 0).is_err(), "version {}", version);
        }
        let mut handler = Flags {
            actions: 0,
            protocol: 0,
            version: 6,
        };
        // MTA older than what the handler picked.
        assert!(negotiate(&mut handler, 4, 0, 0).is_err());
    }

    #[test]
    fn response_packet_layout() {
        let mut handler = Flags {
            actions: 0,
            protocol: 0,
            version: 6,
        };
        let negotiated = negotiate(&mut handler, 6, 0, 0).unwrap();
        let packet = negotiated.packet();
        assert_eq!(packet.code, SMFIC_OPTNEG);
        assert_eq!(&packet.payload[0..4], &6u32.to_be_bytes());
        // Macro requests ride along on protocol 6.
        assert!(packet.payload.len() > 12);
        assert_eq!(&packet.payload[12..16], &0u32.to_be_bytes());
    }

    #[test]
    fn old_protocol_omits_macro_requests() {
        let mut handler = Flags {
            actions: 0,
            protocol: 0,
            version: 2,
        };
        let negotiated = negotiate(&mut handler, 6, 0, 0).unwrap();
        assert_eq!(negotiated.packet().payload.len(), 12);
    }
}
