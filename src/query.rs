use std::collections::HashSet;

use crate::{
    identity::Identity,
    key::{Distance, Key},
    ALPHA_VALUE, K_VALUE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    NotContacted,
    Waiting,
    Succeeded,
}

#[derive(Debug)]
struct Peer {
    identity: Identity,
    distance: Distance,
    state: PeerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    Iterating,
    Finished,
}

/// Shortlist driving an iterative lookup towards `target`.
///
/// The caller asks for a round of peers with [`ClosestPeersIter::next_round`],
/// reports every answer with [`ClosestPeersIter::on_success`] or
/// [`ClosestPeersIter::on_failure`] and closes the round with
/// [`ClosestPeersIter::finish_round`]. The shortlist keeps the `num_results`
/// closest peers that have not failed, ordered by distance to the target.
#[derive(Debug)]
pub struct ClosestPeersIter {
    local_key: Key,
    target: Key,
    peers: Vec<Peer>,
    /// Peers that failed to answer, never added back.
    failed: HashSet<Key>,
    /// Peers queried in the current round. They may have been pushed out of
    /// the shortlist by closer peers and still get their answer merged.
    in_flight: HashSet<Key>,
    num_results: usize,
    parallelism: usize,
    state: IterState,
    /// Closest distance in the shortlist when the current round started.
    round_best: Option<Distance>,
    progressed: bool,
    round_successes: usize,
    rounds: usize,
}

impl ClosestPeersIter {
    pub fn new(local_key: Key, target: Key, seeds: Vec<Identity>) -> Self {
        Self::with_config(local_key, target, seeds, K_VALUE, ALPHA_VALUE)
    }

    pub fn with_config(
        local_key: Key,
        target: Key,
        seeds: Vec<Identity>,
        num_results: usize,
        parallelism: usize,
    ) -> Self {
        let mut iter = Self {
            local_key,
            target,
            peers: Vec::with_capacity(num_results),
            failed: HashSet::new(),
            in_flight: HashSet::new(),
            num_results,
            parallelism: parallelism.max(1),
            state: IterState::Iterating,
            round_best: None,
            progressed: false,
            round_successes: 0,
            rounds: 0,
        };

        for seed in seeds {
            iter.insert(seed);
        }

        iter
    }

    pub fn target(&self) -> &Key {
        &self.target
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn is_finished(&self) -> bool {
        self.state == IterState::Finished
    }

    /// Adds a candidate, keeping the shortlist sorted, deduplicated and capped.
    fn insert(&mut self, identity: Identity) {
        if identity.key == self.local_key
            || self.failed.contains(&identity.key)
            || self.position(&identity.key).is_some()
        {
            return;
        }

        let distance = self.target.distance(&identity.key);
        let pos = self.peers.partition_point(|peer| peer.distance < distance);
        if pos >= self.num_results {
            return;
        }

        if self.round_best.map_or(false, |best| distance < best) {
            self.progressed = true;
        }

        let state = if self.in_flight.contains(&identity.key) {
            PeerState::Waiting
        } else {
            PeerState::NotContacted
        };

        self.peers.insert(
            pos,
            Peer {
                identity,
                distance,
                state,
            },
        );
        self.peers.truncate(self.num_results);
    }

    fn position(&self, key: &Key) -> Option<usize> {
        self.peers.iter().position(|peer| peer.identity.key == *key)
    }

    /// The next peers to query: up to `parallelism` of the closest peers not yet
    /// contacted. An empty round means the lookup is over.
    pub fn next_round(&mut self) -> Vec<Identity> {
        if self.is_finished() {
            return Vec::new();
        }

        let round = self
            .peers
            .iter_mut()
            .filter(|peer| peer.state == PeerState::NotContacted)
            .take(self.parallelism)
            .map(|peer| {
                peer.state = PeerState::Waiting;
                peer.identity
            })
            .collect::<Vec<_>>();
        self.in_flight.extend(round.iter().map(|peer| peer.key));

        if round.is_empty() {
            self.state = IterState::Finished;
        } else {
            self.round_best = self.peers.first().map(|peer| peer.distance);
            self.progressed = false;
            self.round_successes = 0;
        }

        round
    }

    /// `peer` answered with the contacts it knows closest to the target.
    ///
    /// The answer is merged even when `peer` itself no longer ranks among the
    /// closest peers.
    pub fn on_success(&mut self, peer: &Key, closer_peers: Vec<Identity>) {
        if !self.in_flight.remove(peer) {
            return;
        }

        self.round_successes += 1;
        if let Some(pos) = self.position(peer) {
            self.peers[pos].state = PeerState::Succeeded;
        }

        for identity in closer_peers {
            self.insert(identity);
        }
    }

    /// `peer` did not answer; it is dropped from the shortlist for good.
    pub fn on_failure(&mut self, peer: &Key) {
        if !self.in_flight.remove(peer) {
            return;
        }

        self.failed.insert(*peer);
        if let Some(pos) = self.position(peer) {
            self.peers.remove(pos);
        }
    }

    /// Closes the current round and decides whether another one is needed.
    ///
    /// The lookup converges once a round in which at least one peer answered
    /// brought no peer closer than the best one known when the round started,
    /// or once every peer in the shortlist has been queried.
    pub fn finish_round(&mut self) {
        if self.is_finished() {
            return;
        }
        self.rounds += 1;

        // Peers never reported back count as failed.
        self.failed.extend(self.in_flight.drain());
        self.peers.retain(|peer| peer.state != PeerState::Waiting);

        let converged = self.round_successes > 0 && !self.progressed;
        let exhausted = self
            .peers
            .iter()
            .all(|peer| peer.state == PeerState::Succeeded);

        if converged || exhausted {
            self.state = IterState::Finished;
        }
    }

    pub fn finish(&mut self) {
        self.state = IterState::Finished;
    }

    /// The shortlist: every peer that has not failed, closest first.
    pub fn into_result(self) -> Vec<Identity> {
        self.peers.into_iter().map(|peer| peer.identity).collect()
    }
}
