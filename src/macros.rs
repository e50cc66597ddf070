//! Per-phase macro (symbol) requests, negotiated once per connection.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Macro stages the MTA recognizes in a symbol-list request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connect,
    Helo,
    EnvFrom,
    EnvRcpt,
    Data,
    Eom,
    Eoh,
}

impl Stage {
    /// Wire identifier of the stage. EOM sorts before EOH here; the
    /// protocol numbers them that way.
    pub fn id(self) -> u32 {
        match self {
            Stage::Connect => 0,
            Stage::Helo => 1,
            Stage::EnvFrom => 2,
            Stage::EnvRcpt => 3,
            Stage::Data => 4,
            Stage::Eom => 5,
            Stage::Eoh => 6,
        }
    }

    /// All stages in wire-identifier order.
    pub const ALL: [Stage; 7] = [
        Stage::Connect,
        Stage::Helo,
        Stage::EnvFrom,
        Stage::EnvRcpt,
        Stage::Data,
        Stage::Eom,
        Stage::Eoh,
    ];
}

fn empty_set() -> &'static HashSet<String> {
    static EMPTY: OnceLock<HashSet<String>> = OnceLock::new();
    EMPTY.get_or_init(HashSet::new)
}

/// The symbol names a handler wants delivered at each phase.
///
/// Built by the handler, read by the negotiation step, and immutable for
/// the rest of the connection. The transport consults it to decide which
/// MTA-supplied macro definitions to keep.
#[derive(Debug, Clone, Default)]
pub struct MacroRequests {
    requests: HashMap<Stage, HashSet<String>>,
}

impl MacroRequests {
    pub fn new() -> Self {
        MacroRequests::default()
    }

    /// Request `symbol` at `stage`. Chains for handler construction.
    pub fn want(mut self, stage: Stage, symbol: &str) -> Self {
        self.requests
            .entry(stage)
            .or_default()
            .insert(symbol.to_string());
        self
    }

    /// Symbols requested for `stage`. An unrequested stage yields the
    /// empty set, not absence.
    pub fn symbols(&self, stage: Stage) -> &HashSet<String> {
        self.requests.get(&stage).unwrap_or_else(|| empty_set())
    }

    pub fn is_empty(&self) -> bool {
        self.requests.values().all(|set| set.is_empty())
    }

    /// Encode into the option-negotiation response payload: per non-empty
    /// stage, a big-endian stage id followed by the NUL-terminated,
    /// space-joined symbol list.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for stage in Stage::ALL {
            let set = self.symbols(stage);
            if set.is_empty() {
                continue;
            }
            let mut names: Vec<&str> = set.iter().map(|s| s.as_str()).collect();
            names.sort_unstable();
            out.extend_from_slice(&stage.id().to_be_bytes());
            out.extend_from_slice(names.join(" ").as_bytes());
            out.push(0);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrequested_stage_is_empty_set() {
        let reqs = MacroRequests::new().want(Stage::Connect, "j");
        assert!(reqs.symbols(Stage::Helo).is_empty());
        assert_eq!(reqs.symbols(Stage::Connect).len(), 1);
    }

    #[test]
    fn encode_orders_stages_and_sorts_symbols() {
        let reqs = MacroRequests::new()
            .want(Stage::Eom, "i")
            .want(Stage::Connect, "j")
            .want(Stage::Connect, "_");
        let encoded = reqs.encode();

        let mut expected = Vec::new();
        expected.extend_from_slice(&0u32.to_be_bytes());
        expected.extend_from_slice(b"_ j\0");
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"i\0");
        assert_eq!(encoded, expected);
    }

    #[test]
    fn empty_requests_encode_to_nothing() {
        assert!(MacroRequests::new().encode().is_empty());
        assert!(MacroRequests::new().is_empty());
    }
}
