//! Client Registry & Vote Ledger (§4.C): suspend-request / prepare-suspend
//! voting rounds.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Round {
    SuspendRequest,
    PrepareSuspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    NoResponse,
    Ack,
    Nack,
}

struct ClientRecord {
    name: String,
    opt_in_suspend_request: bool,
    opt_in_prepare_suspend: bool,
    response: HashMap<Round, Response>,
    nack_counts: HashMap<Round, u64>,
    last_logged_nack_count: HashMap<Round, u64>,
}

impl ClientRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            opt_in_suspend_request: false,
            opt_in_prepare_suspend: false,
            response: HashMap::new(),
            nack_counts: HashMap::new(),
            last_logged_nack_count: HashMap::new(),
        }
    }

    fn opted_in(&self, round: Round) -> bool {
        match round {
            Round::SuspendRequest => self.opt_in_suspend_request,
            Round::PrepareSuspend => self.opt_in_prepare_suspend,
        }
    }
}

struct Tally {
    expected_acks: usize,
    ack_count: usize,
}

struct Ledger {
    clients: HashMap<String, ClientRecord>,
    tallies: HashMap<Round, Tally>,
}

/// The Client Registry and its per-attempt Vote Ledger.
pub struct ClientRegistry {
    inner: Mutex<Ledger>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Ledger {
                clients: HashMap::new(),
                tallies: HashMap::new(),
            }),
        }
    }

    pub fn register(&self, uid: &str, name: &str) {
        let mut ledger = self.inner.lock().unwrap();
        ledger
            .clients
            .entry(uid.to_string())
            .or_insert_with(|| ClientRecord::new(name.to_string()));
    }

    pub fn unregister(&self, uid: &str) {
        let mut ledger = self.inner.lock().unwrap();
        ledger.clients.remove(uid);
    }

    pub fn unregister_by_name(&self, name: &str) {
        let mut ledger = self.inner.lock().unwrap();
        ledger.clients.retain(|_, c| c.name != name);
    }

    pub fn opt_in(&self, uid: &str, round: Round, enabled: bool) {
        let mut ledger = self.inner.lock().unwrap();
        if let Some(client) = ledger.clients.get_mut(uid) {
            match round {
                Round::SuspendRequest => client.opt_in_suspend_request = enabled,
                Round::PrepareSuspend => client.opt_in_prepare_suspend = enabled,
            }
        }
    }

    /// Resets every client's response for both rounds to `NoResponse` and
    /// recomputes expected-ack totals from the currently opted-in clients.
    pub fn vote_init(&self) {
        let mut ledger = self.inner.lock().unwrap();
        for client in ledger.clients.values_mut() {
            client
                .response
                .insert(Round::SuspendRequest, Response::NoResponse);
            client
                .response
                .insert(Round::PrepareSuspend, Response::NoResponse);
        }

        for round in [Round::SuspendRequest, Round::PrepareSuspend] {
            let expected = ledger.clients.values().filter(|c| c.opted_in(round)).count();
            ledger
                .tallies
                .insert(round, Tally { expected_acks: expected, ack_count: 0 });
        }
    }

    /// Records a vote (latching — a later Nack does not undo an earlier Ack
    /// in the same round). Returns `false` if `uid` is unknown. Returns
    /// `true` iff the vote was a Nack, or an Ack that brought the tally to
    /// the expected total; callers distinguish the two via `approved`.
    pub fn vote(&self, uid: &str, round: Round, ack: bool) -> bool {
        let mut ledger = self.inner.lock().unwrap();
        let Some(client) = ledger.clients.get_mut(uid) else {
            return false;
        };

        let already_responded = !matches!(
            client.response.get(&round),
            None | Some(Response::NoResponse)
        );

        if !ack {
            if !already_responded {
                client.response.insert(round, Response::Nack);
            }
            *client.nack_counts.entry(round).or_insert(0) += 1;
            log_top_nacker_if_changed(client, round);
            return true;
        }

        if already_responded {
            // First response wins; duplicate votes are ignored for tally
            // purposes but still "handled" (return value below).
            return ledger
                .tallies
                .get(&round)
                .map(|t| t.ack_count >= t.expected_acks)
                .unwrap_or(false);
        }

        client.response.insert(round, Response::Ack);
        let tally = ledger.tallies.entry(round).or_insert(Tally {
            expected_acks: 0,
            ack_count: 0,
        });
        tally.ack_count += 1;
        tally.ack_count >= tally.expected_acks
    }

    /// True iff the round has reached its expected Ack total. Remains true
    /// until `vote_init` is next called (§8 invariant 5).
    pub fn approved(&self, round: Round) -> bool {
        let ledger = self.inner.lock().unwrap();
        ledger
            .tallies
            .get(&round)
            .map(|t| t.ack_count >= t.expected_acks)
            .unwrap_or(true)
    }

    /// True iff any opted-in client has recorded a Nack for this round in
    /// the current attempt. A Nack is the only thing that aborts a round
    /// early (§8 "Propagation policy": unresponsiveness is not an error).
    pub fn nacked(&self, round: Round) -> bool {
        let ledger = self.inner.lock().unwrap();
        ledger
            .clients
            .values()
            .any(|c| matches!(c.response.get(&round), Some(Response::Nack)))
    }

    /// True iff any opted-in client has not yet responded this round —
    /// used to log the silent-client list on timeout.
    pub fn unresponsive(&self, round: Round) -> Vec<String> {
        let ledger = self.inner.lock().unwrap();
        ledger
            .clients
            .values()
            .filter(|c| c.opted_in(round))
            .filter(|c| matches!(c.response.get(&round), None | Some(Response::NoResponse)))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn snapshot(&self, round: Round) -> String {
        let ledger = self.inner.lock().unwrap();
        let mut out = String::new();
        for client in ledger.clients.values() {
            if !client.opted_in(round) {
                continue;
            }
            let response = client.response.get(&round).copied().unwrap_or(Response::NoResponse);
            out.push_str(&format!("{}: {:?}\n", client.name, response));
        }
        out
    }
}

fn log_top_nacker_if_changed(client: &mut ClientRecord, round: Round) {
    let count = *client.nack_counts.get(&round).unwrap_or(&0);
    let last_logged = client.last_logged_nack_count.entry(round).or_insert(0);
    if count > *last_logged {
        *last_logged = count;
        warn!(
            target: "clients",
            client = %client.name,
            round = ?round,
            cumulative_nacks = count,
            "client nacked suspend round"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_uid_vote_is_noop() {
        let reg = ClientRegistry::new();
        assert!(!reg.vote("ghost", Round::SuspendRequest, true));
    }

    #[test]
    fn approved_true_when_all_opted_in_ack() {
        let reg = ClientRegistry::new();
        reg.register("a", "alpha");
        reg.register("b", "beta");
        reg.opt_in("a", Round::SuspendRequest, true);
        reg.opt_in("b", Round::SuspendRequest, true);
        reg.vote_init();

        assert!(!reg.approved(Round::SuspendRequest));
        assert!(!reg.vote("a", Round::SuspendRequest, true));
        assert!(reg.vote("b", Round::SuspendRequest, true));
        assert!(reg.approved(Round::SuspendRequest));
    }

    #[test]
    fn nack_returns_true_and_flips_approved_is_false() {
        let reg = ClientRegistry::new();
        reg.register("a", "alpha");
        reg.opt_in("a", Round::SuspendRequest, true);
        reg.vote_init();

        assert!(reg.vote("a", Round::SuspendRequest, false));
        assert!(!reg.approved(Round::SuspendRequest));
    }

    #[test]
    fn latching_second_response_does_not_undo_first() {
        let reg = ClientRegistry::new();
        reg.register("a", "alpha");
        reg.opt_in("a", Round::SuspendRequest, true);
        reg.vote_init();

        assert!(reg.vote("a", Round::SuspendRequest, true));
        assert!(reg.approved(Round::SuspendRequest));
        // A later Nack from the same client in the same attempt must not
        // turn the earlier Ack back off.
        reg.vote("a", Round::SuspendRequest, false);
        assert!(reg.approved(Round::SuspendRequest));
    }

    #[test]
    fn approved_stays_true_until_next_vote_init() {
        let reg = ClientRegistry::new();
        reg.register("a", "alpha");
        reg.opt_in("a", Round::SuspendRequest, true);
        reg.vote_init();
        reg.vote("a", Round::SuspendRequest, true);
        assert!(reg.approved(Round::SuspendRequest));

        reg.vote_init();
        assert!(!reg.approved(Round::SuspendRequest));
    }

    #[test]
    fn nack_counters_accumulate_across_attempts() {
        let reg = ClientRegistry::new();
        reg.register("a", "alpha");
        reg.opt_in("a", Round::SuspendRequest, true);

        reg.vote_init();
        reg.vote("a", Round::SuspendRequest, false);
        reg.vote_init();
        reg.vote("a", Round::SuspendRequest, false);

        let ledger = reg.inner.lock().unwrap();
        assert_eq!(
            *ledger.clients["a"].nack_counts.get(&Round::SuspendRequest).unwrap(),
            2
        );
    }
}
