// Model-checked core of the single-decree Paxos reconfiguration round
// (§9 "Ambiguous behavior" note on reconfiguration; §8 T2/T3). The
// teacher's top-of-file comment in `submerge-txn` pointed at
// `stateright`'s own `examples/paxos.rs` as "probably the best one to
// use" for this — this module is that pointer followed through: a
// minimal ballot/acceptor model checked for single-decree safety
// (at most one epoch ever gets decided).
//
// This models just the reconfiguration vote itself, not the full
// replicated-log Paxos used for normal commits — reconfiguration only
// ever needs to decide one value (the next epoch's starting
// configuration), so the full log machinery is out of scope here.

use stateright::{Checker, Model, Property};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReconfigState {
    /// Highest ballot each acceptor has promised.
    pub promised: Vec<u32>,
    /// Highest-ballot value each acceptor has accepted, if any.
    pub accepted: Vec<Option<(u32, u8)>>,
    pub decided: Option<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ReconfigAction {
    Prepare { acceptor: usize, ballot: u32 },
    Accept { acceptor: usize, ballot: u32, epoch: u8 },
}

/// `acceptor_count` acceptors vote on whether `candidate_epoch` becomes
/// the next epoch; any majority-accepted ballot decides it.
pub struct ReconfigModel {
    pub acceptor_count: usize,
    pub candidate_epoch: u8,
    pub max_ballot: u32,
}

impl ReconfigModel {
    fn quorum(&self) -> usize {
        self.acceptor_count / 2 + 1
    }
}

impl Model for ReconfigModel {
    type State = ReconfigState;
    type Action = ReconfigAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![ReconfigState {
            promised: vec![0; self.acceptor_count],
            accepted: vec![None; self.acceptor_count],
            decided: None,
        }]
    }

    fn actions(&self, _state: &Self::State, actions: &mut Vec<Self::Action>) {
        for acceptor in 0..self.acceptor_count {
            for ballot in 1..=self.max_ballot {
                actions.push(ReconfigAction::Prepare { acceptor, ballot });
                actions.push(ReconfigAction::Accept {
                    acceptor,
                    ballot,
                    epoch: self.candidate_epoch,
                });
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            ReconfigAction::Prepare { acceptor, ballot } => {
                if ballot > next.promised[acceptor] {
                    next.promised[acceptor] = ballot;
                }
            }
            ReconfigAction::Accept { acceptor, ballot, epoch } => {
                if ballot >= next.promised[acceptor] {
                    next.promised[acceptor] = ballot;
                    next.accepted[acceptor] = Some((ballot, epoch));
                    let count = next
                        .accepted
                        .iter()
                        .filter(|a| **a == Some((ballot, epoch)))
                        .count();
                    if count >= self.quorum() {
                        next.decided = Some(epoch);
                    }
                }
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![Property::<Self>::always("single decree", |model, state| {
            state
                .decided
                .map(|e| e == model.candidate_epoch)
                .unwrap_or(true)
        })]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reconfiguration_never_decides_a_different_epoch() {
        let model = ReconfigModel {
            acceptor_count: 3,
            candidate_epoch: 1,
            max_ballot: 3,
        };
        model.checker().spawn_dfs().join().assert_properties();
    }
}
