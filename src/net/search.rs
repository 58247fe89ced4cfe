//! Search sessions: bounded, retrying FIND/FOUND/NOTFOUND exchanges that
//! aggregate replies across retries while tolerating packet loss.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use crate::wire::FileData;

/// One peer's answer to a FIND.
#[derive(Debug, Clone)]
enum PeerAnswer {
    Found(FileData),
    NotFound,
}

/// A found peer's reply, surfaced to callers of [`crate::net::Discovery::search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundResponse {
    pub name: String,
    pub digest: String,
    pub size: u64,
    pub provider_ip: IpAddr,
}

/// At most one session per name.
pub struct SearchSession {
    pub name: String,
    pub requested_digest: Option<String>,
    answers: Mutex<HashMap<IpAddr, PeerAnswer>>,
    pending: Mutex<HashSet<IpAddr>>,
}

impl SearchSession {
    pub fn new(name: String, requested_digest: Option<String>, expected: HashSet<IpAddr>) -> Self {
        Self {
            name,
            requested_digest,
            answers: Mutex::new(HashMap::new()),
            pending: Mutex::new(expected),
        }
    }

    /// Records a FOUND. FOUND always wins over a prior NOTFOUND from the
    /// same peer.
    pub fn record_found(&self, from: IpAddr, data: FileData) {
        self.pending.lock().unwrap().remove(&from);
        self.answers.lock().unwrap().insert(from, PeerAnswer::Found(data));
    }

    /// Records a NOTFOUND, but only if no FOUND from this peer exists yet.
    pub fn record_not_found(&self, from: IpAddr) {
        self.pending.lock().unwrap().remove(&from);
        let mut answers = self.answers.lock().unwrap();
        answers.entry(from).or_insert(PeerAnswer::NotFound);
    }

    /// Peers from the initial snapshot that have not yet answered.
    pub fn still_pending(&self) -> HashSet<IpAddr> {
        self.pending.lock().unwrap().clone()
    }

    /// Groups FOUND responses by the *responder's reported digest*, not the
    /// digest the caller searched for. NOTFOUND responses are not included.
    pub fn results(&self) -> HashMap<String, Vec<FoundResponse>> {
        let mut grouped: HashMap<String, Vec<FoundResponse>> = HashMap::new();
        for (ip, answer) in self.answers.lock().unwrap().iter() {
            if let PeerAnswer::Found(data) = answer {
                let digest = data.digest.clone().unwrap_or_default();
                grouped.entry(digest.clone()).or_default().push(FoundResponse {
                    name: data.name.clone(),
                    digest,
                    size: data.size,
                    provider_ip: *ip,
                });
            }
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> IpAddr {
        format!("10.0.0.{n}").parse().unwrap()
    }

    #[test]
    fn found_wins_over_prior_not_found() {
        let session = SearchSession::new("f".into(), None, HashSet::from([ip(1)]));
        session.record_not_found(ip(1));
        session.record_found(ip(1), FileData::new("f", Some("d".repeat(64)), 10));
        let results = session.results();
        assert_eq!(results.get(&"d".repeat(64)).unwrap().len(), 1);
    }

    #[test]
    fn not_found_does_not_overwrite_existing_found() {
        let session = SearchSession::new("f".into(), None, HashSet::from([ip(1)]));
        session.record_found(ip(1), FileData::new("f", Some("d".repeat(64)), 10));
        session.record_not_found(ip(1));
        let results = session.results();
        assert_eq!(results.get(&"d".repeat(64)).unwrap().len(), 1);
    }

    #[test]
    fn results_group_by_responder_digest_not_requested_digest() {
        let session = SearchSession::new(
            "f".into(),
            Some("a".repeat(64)),
            HashSet::from([ip(1), ip(2)]),
        );
        session.record_found(ip(1), FileData::new("f", Some("a".repeat(64)), 10));
        session.record_found(ip(2), FileData::new("f", Some("b".repeat(64)), 10));
        let results = session.results();
        assert_eq!(results.len(), 2);
        assert!(results.contains_key(&"a".repeat(64)));
        assert!(results.contains_key(&"b".repeat(64)));
    }

    #[test]
    fn pending_shrinks_as_answers_arrive() {
        let session = SearchSession::new("f".into(), None, HashSet::from([ip(1), ip(2)]));
        assert_eq!(session.still_pending().len(), 2);
        session.record_found(ip(1), FileData::new("f", None, 0));
        assert_eq!(session.still_pending(), HashSet::from([ip(2)]));
    }
}
