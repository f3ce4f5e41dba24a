#![allow(dead_code)]

// Deterministic Sequencer/Worker (§4.8): a single component responsible
// for assigning global slots to multi-partition transactions and
// ensuring every partition executes the pieces addressed to it in that
// same slot order (D1 monotone assignment, D2 same order on every
// replica, D3 a piece only ever runs on its owning partition).

mod sequencer;

pub use sequencer::{ConsensusSubmit, NullConsensus, PieceHandler, Sequencer};
