//!
//! Sum-product forward/backward over the k-mer state space.
//!
//! Produces the total log-likelihood of an event sequence and the posterior
//! state probabilities the scaling trainer uses as weights. Everything stays
//! in log space; unreachable states are p=0 and absorb correctly.
//!

use super::table::StateTable;
use crate::event::EventSequence;
use crate::model::PoreModel;
use crate::prob::Prob;
use crate::transitions::Transitions;

///
/// Filled α and β tables for one (events, model, transitions) triple.
///
/// * `α[t][j]` = P(events[0..=t], state_t = j)
/// * `β[t][i]` = P(events[t+1..] | state_t = i)
/// * `Z` = logsumexp_j α[T-1][j]
///
#[derive(Debug, Clone)]
pub struct ForwardBackward {
    alpha: Vec<StateTable>,
    beta: Vec<StateTable>,
    z: Prob,
}

impl ForwardBackward {
    ///
    /// Fill both tables. The model must already be scaled and the events
    /// drift-corrected.
    ///
    pub fn fill(
        model: &PoreModel,
        transitions: &Transitions,
        events: &EventSequence,
    ) -> ForwardBackward {
        assert_eq!(model.n_states(), transitions.n_states());
        let s = model.n_states();
        let t_len = events.len();
        if t_len == 0 {
            return ForwardBackward {
                alpha: Vec::new(),
                beta: Vec::new(),
                z: Prob::one(),
            };
        }

        // cache emissions: E[t][j]
        let emit: Vec<StateTable> = (0..t_len)
            .map(|t| {
                let mut row = StateTable::zero(s);
                for j in 0..s {
                    row[j] = model.emission_log_pdf(j, &events[t]);
                }
                row
            })
            .collect();

        let init = Prob::from_log_prob(-(s as f64).ln());
        let mut alpha = Vec::with_capacity(t_len);
        let mut first = StateTable::zero(s);
        for j in 0..s {
            first[j] = init * emit[0][j];
        }
        alpha.push(first);
        for t in 1..t_len {
            let prev = &alpha[t - 1];
            let mut cur = StateTable::zero(s);
            for j in 0..s {
                let sum: Prob = transitions
                    .predecessors(j)
                    .map(|(i, tp)| prev[i] * tp)
                    .sum();
                cur[j] = sum * emit[t][j];
            }
            alpha.push(cur);
        }

        let mut beta = vec![StateTable::zero(s); t_len];
        beta[t_len - 1] = StateTable::filled(s, Prob::one());
        for t in (0..t_len - 1).rev() {
            let (head, tail) = beta.split_at_mut(t + 1);
            let row = &mut head[t];
            let next = &tail[0];
            for i in 0..s {
                row[i] = transitions
                    .successors(i)
                    .map(|(j, tp)| tp * emit[t + 1][j] * next[j])
                    .sum();
            }
        }

        let z = alpha[t_len - 1].sum();
        ForwardBackward { alpha, beta, z }
    }

    /// Total log-likelihood Z.
    pub fn total_log_likelihood(&self) -> Prob {
        self.z
    }
    pub fn n_events(&self) -> usize {
        self.alpha.len()
    }
    pub fn alpha(&self, t: usize) -> &StateTable {
        &self.alpha[t]
    }
    pub fn beta(&self, t: usize) -> &StateTable {
        &self.beta[t]
    }
    ///
    /// Posterior state probabilities γ[t][j] = α[t][j] + β[t][j] − Z.
    /// Each row logsumexps to 0.
    ///
    pub fn posterior(&self, t: usize) -> StateTable {
        let s = self.alpha[t].n_states();
        let mut row = StateTable::zero(s);
        let inv_z = Prob::from_log_prob(-self.z.to_log_value());
        for j in 0..s {
            row[j] = self.alpha[t][j] * self.beta[t][j] * inv_z;
        }
        row
    }
}

//
// tests
//
