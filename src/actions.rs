use tokio::sync::mpsc;

use crate::error::MilterError;
use crate::status::Status;
use crate::wire::{
    Packet, SMFIF_ADDHDRS, SMFIF_ADDRCPT, SMFIF_ADDRCPT_PAR, SMFIF_CHGBODY, SMFIF_CHGFROM,
    SMFIF_CHGHDRS, SMFIF_DELRCPT, SMFIF_QUARANTINE, SMFIR_ADDHEADER, SMFIR_ADDRCPT,
    SMFIR_ADDRCPT_PAR, SMFIR_CHGFROM, SMFIR_CHGHEADER, SMFIR_DELRCPT, SMFIR_INSHEADER,
    SMFIR_PROGRESS, SMFIR_QUARANTINE, SMFIR_REPLBODY,
};

/// Message mutations available during the `eoh` and `eom` callbacks.
///
/// Mutations are buffered and flushed by the session ahead of the final
/// end-of-message reply. `progress` bypasses the buffer when the
/// transport installed a progress sink, so long-running EOM work can
/// keep the MTA's read timeout from expiring. Every mutation needs its
/// `SMFIF_` bit from negotiation; without it the call is refused.
pub struct Actions {
    allowed: u32,
    packets: Vec<Packet>,
    progress_sink: Option<mpsc::UnboundedSender<Packet>>,
    finished: Option<Status>,
}

fn cstr(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    out
}

impl Actions {
    pub(crate) fn new(allowed: u32, progress_sink: Option<mpsc::UnboundedSender<Packet>>) -> Self {
        Actions {
            allowed,
            packets: Vec::new(),
            progress_sink,
            finished: None,
        }
    }

    fn check(&self, flag: u32, what: &'static str) -> Result<(), MilterError> {
        if self.finished.is_some() {
            return Err(MilterError::ActionRefused("finish was already called"));
        }
        if flag != 0 && self.allowed & flag == 0 {
            return Err(MilterError::ActionRefused(what));
        }
        Ok(())
    }

    /// Add a header to the current message, replacing an existing one of
    /// the same name.
    pub fn addheader(&mut self, name: &str, value: &str) -> Result<(), MilterError> {
        self.check(SMFIF_ADDHDRS, "addheader requires SMFIF_ADDHDRS")?;
        let mut payload = cstr(name);
        payload.extend_from_slice(&cstr(value));
        self.packets.push(Packet::with_payload(SMFIR_ADDHEADER, payload));
        Ok(())
    }

    /// Insert a header without replacing. `index` 0 prepends.
    pub fn insheader(&mut self, index: u32, name: &str, value: &str) -> Result<(), MilterError> {
        self.check(SMFIF_ADDHDRS, "insheader requires SMFIF_ADDHDRS")?;
        let mut payload = index.to_be_bytes().to_vec();
        payload.extend_from_slice(&cstr(name));
        payload.extend_from_slice(&cstr(value));
        self.packets.push(Packet::with_payload(SMFIR_INSHEADER, payload));
        Ok(())
    }

    /// Change or delete a header. `index` is 1-based and counts
    /// occurrences of `name`; an index past the last occurrence adds a
    /// new copy. `None` deletes the header.
    pub fn chgheader(
        &mut self,
        name: &str,
        index: u32,
        value: Option<&str>,
    ) -> Result<(), MilterError> {
        self.check(SMFIF_CHGHDRS, "chgheader requires SMFIF_CHGHDRS")?;
        let mut payload = index.to_be_bytes().to_vec();
        payload.extend_from_slice(&cstr(name));
        payload.extend_from_slice(&cstr(value.unwrap_or("")));
        self.packets.push(Packet::with_payload(SMFIR_CHGHEADER, payload));
        Ok(())
    }

    /// Add a recipient to the envelope.
    pub fn addrcpt(&mut self, rcpt: &str) -> Result<(), MilterError> {
        self.check(SMFIF_ADDRCPT, "addrcpt requires SMFIF_ADDRCPT")?;
        self.packets
            .push(Packet::with_payload(SMFIR_ADDRCPT, cstr(rcpt)));
        Ok(())
    }

    /// Add a recipient with ESMTP arguments.
    pub fn addrcpt_par(&mut self, rcpt: &str, args: &str) -> Result<(), MilterError> {
        self.check(SMFIF_ADDRCPT_PAR, "addrcpt_par requires SMFIF_ADDRCPT_PAR")?;
        let mut payload = cstr(rcpt);
        payload.extend_from_slice(&cstr(args));
        self.packets
            .push(Packet::with_payload(SMFIR_ADDRCPT_PAR, payload));
        Ok(())
    }

    /// Remove a recipient from the envelope.
    pub fn delrcpt(&mut self, rcpt: &str) -> Result<(), MilterError> {
        self.check(SMFIF_DELRCPT, "delrcpt requires SMFIF_DELRCPT")?;
        self.packets
            .push(Packet::with_payload(SMFIR_DELRCPT, cstr(rcpt)));
        Ok(())
    }

    /// Change the envelope sender.
    pub fn chgfrom(&mut self, from: &str) -> Result<(), MilterError> {
        self.check(SMFIF_CHGFROM, "chgfrom requires SMFIF_CHGFROM")?;
        self.packets
            .push(Packet::with_payload(SMFIR_CHGFROM, cstr(from)));
        Ok(())
    }

    /// Quarantine the message, with a reason.
    pub fn quarantine(&mut self, reason: &str) -> Result<(), MilterError> {
        self.check(SMFIF_QUARANTINE, "quarantine requires SMFIF_QUARANTINE")?;
        self.packets
            .push(Packet::with_payload(SMFIR_QUARANTINE, cstr(reason)));
        Ok(())
    }

    /// Replace the message body with this chunk. The first call replaces
    /// the body; each further call appends. Data should be in CRLF form.
    pub fn replacebody(&mut self, chunk: &[u8]) -> Result<(), MilterError> {
        self.check(SMFIF_CHGBODY, "replacebody requires SMFIF_CHGBODY")?;
        self.packets
            .push(Packet::with_payload(SMFIR_REPLBODY, chunk.to_vec()));
        Ok(())
    }

    /// Tell the MTA the operation is still in progress. Forwarded
    /// immediately when a progress sink is installed, otherwise buffered
    /// in order with the mutations.
    pub fn progress(&mut self) -> Result<(), MilterError> {
        self.check(0, "progress")?;
        let packet = Packet::new(SMFIR_PROGRESS);
        match &self.progress_sink {
            Some(sink) => {
                if sink.send(packet).is_err() {
                    log::warn!("progress sink dropped, buffering progress packet");
                    self.packets.push(Packet::new(SMFIR_PROGRESS));
                }
            }
            None => self.packets.push(packet),
        }
        Ok(())
    }

    /// Set the final status for this callback and invalidate the object.
    /// Any later call on it fails with [`MilterError::ActionRefused`].
    pub fn finish(&mut self, status: Status) -> Result<(), MilterError> {
        self.check(0, "finish")?;
        self.finished = Some(status);
        Ok(())
    }

    pub(crate) fn take_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    pub(crate) fn take_finished(&mut self) -> Option<Status> {
        self.finished.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{SMFIF_ADDHDRS, SMFIF_CHGHDRS};

    #[test]
    fn mutations_need_their_negotiated_flag() {
        let mut actions = Actions::new(SMFIF_ADDHDRS, None);
        actions.addheader("X-Test", "yes").unwrap();
        assert!(matches!(
            actions.delrcpt("<x@example.org>"),
            Err(MilterError::ActionRefused(_))
        ));
        assert_eq!(actions.take_packets().len(), 1);
    }

    #[test]
    fn chgheader_encoding_deletes_with_empty_value() {
        let mut actions = Actions::new(SMFIF_CHGHDRS, None);
        actions.chgheader("Subject", 1, None).unwrap();
        let packets = actions.take_packets();
        assert_eq!(packets[0].code, SMFIR_CHGHEADER);
        assert_eq!(packets[0].payload, b"\x00\x00\x00\x01Subject\0\0");
    }

    #[test]
    fn finish_invalidates_the_object() {
        let mut actions = Actions::new(SMFIF_ADDHDRS, None);
        actions.finish(Status::Accept).unwrap();
        assert!(matches!(
            actions.addheader("X-Late", "no"),
            Err(MilterError::ActionRefused(_))
        ));
        assert_eq!(actions.take_finished(), Some(Status::Accept));
    }

    #[test]
    fn progress_buffers_without_sink() {
        let mut actions = Actions::new(0, None);
        actions.progress().unwrap();
        let packets = actions.take_packets();
        assert_eq!(packets[0].code, SMFIR_PROGRESS);
    }

    #[test]
    fn progress_forwards_through_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut actions = Actions::new(0, Some(tx));
        actions.progress().unwrap();
        assert_eq!(rx.try_recv().unwrap().code, SMFIR_PROGRESS);
        assert!(actions.take_packets().is_empty());
    }
}
