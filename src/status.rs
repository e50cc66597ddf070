use crate::error::MilterError;
use crate::wire::{
    Packet, SMFIR_ACCEPT, SMFIR_CONTINUE, SMFIR_DISCARD, SMFIR_REJECT, SMFIR_REPLYCODE,
    SMFIR_SKIP, SMFIR_TEMPFAIL,
};

use regex::Regex;

/// Disposition returned by a handler callback.
///
/// The simple variants are process-wide values with no interior state and
/// can be shared freely across sessions. `ReplyCode` carries a fully
/// formed SMTP reply built by [`Status::custom`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Continue processing the current connection, message, or recipient.
    Continue,
    /// Accept without further filtering at the current scope.
    Accept,
    /// Reject the current connection, message, or recipient.
    Reject,
    /// Accept the message but silently drop it. Message/recipient scope
    /// only.
    Discard,
    /// 4xx failure at the current scope.
    Tempfail,
    /// Stop delivering body chunks and continue to end-of-message. Only
    /// meaningful from the body callback, and only when the MTA
    /// negotiated skip support.
    Skip,
    /// Send no reply at all. Only valid where the matching `SMFIP_NR_*`
    /// flag was requested; falls back to `Continue` on the wire when the
    /// MTA does not support it.
    Noreply,
    /// Custom SMTP reply, e.g. `550 5.7.1 go away`.
    ReplyCode(Vec<u8>),
}

/* From RFC 2034 Section 4
 *
 * status-code ::= class "." subject "." detail
 * class       ::= "2" / "4" / "5"
 * subject     ::= 1*3digit
 * detail      ::= 1*3digit
 */
fn validate_rcode(rcode: &str) -> Result<(), MilterError> {
    let re = Regex::new(r"^[245][0-9][0-9]$").unwrap();
    if !re.is_match(rcode) {
        return Err(MilterError::InvalidArgument(format!(
            "rcode must be a 2xx, 4xx or 5xx code, got {:?}",
            rcode
        )));
    }
    Ok(())
}

fn validate_xcode(xcode: &str, rcode: &str) -> Result<(), MilterError> {
    let re = Regex::new(r"^[245]\.[0-9]{1,3}\.[0-9]{1,3}$").unwrap();
    if !re.is_match(xcode) {
        return Err(MilterError::InvalidArgument(format!(
            "xcode must be a 2.x.x, 4.x.x or 5.x.x code, got {:?}",
            xcode
        )));
    }
    // A 4xx rcode takes a 4.x.x xcode, a 5xx rcode a 5.x.x xcode.
    if rcode.as_bytes()[0] != xcode.as_bytes()[0] {
        return Err(MilterError::InvalidArgument(format!(
            "xcode class must match rcode class: {} vs {}",
            rcode, xcode
        )));
    }
    Ok(())
}

impl Status {
    /// Build a `ReplyCode` status from an RFC 2821 reply code, an optional
    /// RFC 2034 extended code and the reply text lines.
    ///
    /// Multi-line replies use the SMTP continuation framing: every line
    /// but the last joins code and text with `-`, the last with a space,
    /// and only the non-last lines carry a CRLF. The MTA's reply parser
    /// depends on this byte-for-byte.
    pub fn custom(
        rcode: &str,
        xcode: Option<&str>,
        message_lines: &[&str],
    ) -> Result<Status, MilterError> {
        validate_rcode(rcode)?;
        if let Some(xcode) = xcode {
            validate_xcode(xcode, rcode)?;
        }

        let mut reply = String::new();

        if message_lines.is_empty() {
            reply.push_str(rcode);
            reply.push(' ');
            if let Some(xcode) = xcode {
                reply.push_str(xcode);
            }
        } else {
            for (i, line) in message_lines.iter().enumerate() {
                let last = i == message_lines.len() - 1;

                reply.push_str(rcode);
                reply.push(if last { ' ' } else { '-' });
                if let Some(xcode) = xcode {
                    reply.push_str(xcode);
                    reply.push(' ');
                }
                reply.push_str(line);
                if !last {
                    reply.push_str("\r\n");
                }
            }
        }

        Ok(Status::ReplyCode(reply.into_bytes()))
    }

    /// Map this disposition to the wire action the transport must send.
    ///
    /// `Noreply` has no wire form; the session decides whether to stay
    /// silent or substitute `Continue`.
    pub fn packet(&self) -> Option<Packet> {
        match self {
            Status::Continue => Some(Packet::new(SMFIR_CONTINUE)),
            Status::Accept => Some(Packet::new(SMFIR_ACCEPT)),
            Status::Reject => Some(Packet::new(SMFIR_REJECT)),
            Status::Discard => Some(Packet::new(SMFIR_DISCARD)),
            Status::Tempfail => Some(Packet::new(SMFIR_TEMPFAIL)),
            Status::Skip => Some(Packet::new(SMFIR_SKIP)),
            Status::Noreply => None,
            Status::ReplyCode(text) => {
                let mut payload = text.clone();
                payload.push(0);
                Some(Packet::with_payload(SMFIR_REPLYCODE, payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_text(status: Status) -> String {
        match status {
            Status::ReplyCode(text) => String::from_utf8(text).unwrap(),
            other => panic!("expected ReplyCode, got {:?}", other),
        }
    }

    #[test]
    fn multiline_with_xcode() {
        let status =
            Status::custom("550", Some("5.1.1"), &["User unknown", "try again"]).unwrap();
        assert_eq!(
            reply_text(status),
            "550-5.1.1 User unknown\r\n550 5.1.1 try again"
        );
    }

    #[test]
    fn bare_rcode_keeps_trailing_space() {
        let status = Status::custom("250", None, &[]).unwrap();
        assert_eq!(reply_text(status), "250 ");
    }

    #[test]
    fn empty_lines_with_xcode() {
        let status = Status::custom("451", Some("4.7.1"), &[]).unwrap();
        assert_eq!(reply_text(status), "451 4.7.1");
    }

    #[test]
    fn single_line() {
        let status = Status::custom("554", None, &["No thanks"]).unwrap();
        assert_eq!(reply_text(status), "554 No thanks");
    }

    #[test]
    fn rejects_bad_rcodes() {
        for rcode in ["", "55", "5500", "155", "355", "abc", "5 0", "4\u{0660}\u{0660}", "5５0"] {
            assert!(
                matches!(
                    Status::custom(rcode, None, &[]),
                    Err(MilterError::InvalidArgument(_))
                ),
                "rcode {:?} should fail",
                rcode
            );
        }
    }

    #[test]
    fn rejects_bad_xcodes() {
        for xcode in ["5.1", "5.1.1.1", "3.1.1", "5.1234.1", "5..1", "x.1.1", "5.\u{0660}.1"] {
            assert!(
                matches!(
                    Status::custom("550", Some(xcode), &[]),
                    Err(MilterError::InvalidArgument(_))
                ),
                "xcode {:?} should fail",
                xcode
            );
        }
    }

    #[test]
    fn rejects_class_mismatch() {
        assert!(matches!(
            Status::custom("550", Some("4.7.1"), &[]),
            Err(MilterError::InvalidArgument(_))
        ));
        assert!(matches!(
            Status::custom("451", Some("5.7.1"), &[]),
            Err(MilterError::InvalidArgument(_))
        ));
        assert!(Status::custom("451", Some("4.7.1"), &[]).is_ok());
        assert!(Status::custom("250", Some("2.0.0"), &[]).is_ok());
    }

    #[test]
    fn simple_statuses_map_to_single_byte_actions() {
        assert_eq!(Status::Continue.packet().unwrap().code, SMFIR_CONTINUE);
        assert_eq!(Status::Accept.packet().unwrap().code, SMFIR_ACCEPT);
        assert_eq!(Status::Reject.packet().unwrap().code, SMFIR_REJECT);
        assert_eq!(Status::Discard.packet().unwrap().code, SMFIR_DISCARD);
        assert_eq!(Status::Tempfail.packet().unwrap().code, SMFIR_TEMPFAIL);
        assert_eq!(Status::Skip.packet().unwrap().code, SMFIR_SKIP);
        assert!(Status::Continue.packet().unwrap().payload.is_empty());
        assert!(Status::Noreply.packet().is_none());
    }

    #[test]
    fn replycode_payload_is_nul_terminated() {
        let packet = Status::custom("550", None, &["nope"])
            .unwrap()
            .packet()
            .unwrap();
        assert_eq!(packet.code, SMFIR_REPLYCODE);
        assert_eq!(packet.payload, b"550 nope\0");
    }
}
