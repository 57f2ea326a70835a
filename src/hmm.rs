//!
//! The DP engines over the k-mer state space.
//!
//! `viterbi` is the max-product decoder used for basecalling; `fwbw` is the
//! sum-product engine used for likelihoods and posterior statistics during
//! scaling. Both work on S-wide `StateTable` rows in log space.
//!

pub mod fwbw;
pub mod table;
pub mod viterbi;

pub use fwbw::ForwardBackward;
pub use table::StateTable;
pub use viterbi::Viterbi;
