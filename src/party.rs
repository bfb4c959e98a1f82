//! Party identifiers and the address map. See spec §3.

use crate::error::RtasError;
use std::collections::BTreeMap;
use std::fmt;

/// One of the three protocol participants.
///
/// P0 and P1 are *compute parties*: they hold additive shares and perform
/// the bulk of computation. P2 is the *assistant party*: it generates
/// correlated randomness (Beaver triples) and may hold Private inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Party {
    /// Compute party 0.
    P0,
    /// Compute party 1.
    P1,
    /// Assistant party.
    P2,
}

impl Party {
    /// All three parties, in a fixed canonical order.
    pub const ALL: [Party; 3] = [Party::P0, Party::P1, Party::P2];

    /// `true` for P0 and P1.
    pub fn is_compute(self) -> bool {
        matches!(self, Party::P0 | Party::P1)
    }

    /// The other compute party, if `self` is a compute party.
    pub fn other_compute(self) -> Option<Party> {
        match self {
            Party::P0 => Some(Party::P1),
            Party::P1 => Some(Party::P0),
            Party::P2 => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Party::P0 => "P0",
            Party::P1 => "P1",
            Party::P2 => "P2",
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Party {
    type Err = RtasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Party::P0),
            "P1" => Ok(Party::P1),
            "P2" => Ok(Party::P2),
            other => Err(RtasError::Configuration(format!(
                "unknown party name {other:?}"
            ))),
        }
    }
}

/// An injective mapping from network endpoint ("host:port") to party
/// identifier, covering all three parties.
#[derive(Debug, Clone)]
pub struct AddressMap {
    by_addr: BTreeMap<String, Party>,
}

impl AddressMap {
    /// Build an address map from `(host:port, party)` pairs.
    ///
    /// Fails with [`RtasError::Configuration`] unless the value set is
    /// exactly `{P0, P1, P2}` — mirroring `FastRTAS.Core.RTAS.RTAS.__init__`,
    /// which rejects any map whose parties aren't exactly this set.
    pub fn new(entries: impl IntoIterator<Item = (String, Party)>) -> Result<Self, RtasError> {
        let by_addr: BTreeMap<String, Party> = entries.into_iter().collect();

        let parties: std::collections::BTreeSet<Party> = by_addr.values().copied().collect();
        if parties != Party::ALL.into_iter().collect() {
            return Err(RtasError::Configuration(format!(
                "address map requires exactly {{P0, P1, P2}}, got {parties:?}"
            )));
        }
        if by_addr.len() != 3 {
            return Err(RtasError::Configuration(
                "address map must be injective (one address per party)".into(),
            ));
        }

        Ok(AddressMap { by_addr })
    }

    /// The address claimed by `party`, if present.
    pub fn addr_of(&self, party: Party) -> Option<&str> {
        self.by_addr
            .iter()
            .find(|(_, p)| **p == party)
            .map(|(a, _)| a.as_str())
    }

    /// The party that owns `addr`, if any.
    pub fn party_of(&self, addr: &str) -> Option<Party> {
        self.by_addr.get(addr).copied()
    }

    /// Iterate over `(addr, party)` pairs excluding `self_party`.
    pub fn peers_of(&self, self_party: Party) -> impl Iterator<Item = (&str, Party)> {
        self.by_addr
            .iter()
            .filter(move |(_, p)| **p != self_party)
            .map(|(a, p)| (a.as_str(), *p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_map() -> Vec<(String, Party)> {
        vec![
            ("127.0.0.1:4900".into(), Party::P0),
            ("127.0.0.1:4901".into(), Party::P1),
            ("127.0.0.1:4902".into(), Party::P2),
        ]
    }

    #[test]
    fn accepts_a_complete_map() {
        let map = AddressMap::new(full_map()).unwrap();
        assert_eq!(map.addr_of(Party::P0), Some("127.0.0.1:4900"));
        assert_eq!(map.party_of("127.0.0.1:4902"), Some(Party::P2));
    }

    #[test]
    fn rejects_missing_party() {
        let mut entries = full_map();
        entries.pop();
        entries.push(("127.0.0.1:4903".into(), Party::P1));
        assert!(AddressMap::new(entries).is_err());
    }

    #[test]
    fn peers_of_excludes_self() {
        let map = AddressMap::new(full_map()).unwrap();
        let peers: Vec<_> = map.peers_of(Party::P0).map(|(_, p)| p).collect();
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&Party::P0));
    }
}
