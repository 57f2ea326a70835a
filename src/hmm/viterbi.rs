//!
//! Max-product decoding of an event sequence into a k-mer path.
//!
//! The table is filled in log space with two rolling S-wide rows; only the
//! back-pointers are kept for all T steps (32-bit state ids). Ties are
//! broken toward the lowest predecessor id, so decoding is deterministic.
//!

use super::table::StateTable;
use crate::event::EventSequence;
use crate::model::PoreModel;
use crate::prob::Prob;
use crate::transitions::Transitions;

const NO_PREDECESSOR: u32 = u32::MAX;

///
/// A filled Viterbi decode: the best state path, its log probability, and
/// the base sequence it spells.
///
#[derive(Debug, Clone)]
pub struct Viterbi {
    path: Vec<usize>,
    path_log_probability: Prob,
    base_seq: String,
}

impl Viterbi {
    ///
    /// Run the decode. The model must already be scaled and the events
    /// drift-corrected; `V[0][j] = log(1/S) + E(j, 0)` and
    /// `V[t][j] = max_i V[t-1][i] + log_p(i -> j) + E(j, t)`.
    ///
    pub fn fill(
        model: &PoreModel,
        transitions: &Transitions,
        events: &EventSequence,
    ) -> Viterbi {
        assert_eq!(model.n_states(), transitions.n_states());
        let space = model.space();
        let s = space.n_states();
        let t_len = events.len();
        if t_len == 0 {
            return Viterbi {
                path: Vec::new(),
                path_log_probability: Prob::zero(),
                base_seq: String::new(),
            };
        }

        let init = Prob::from_log_prob(-(s as f64).ln());
        let mut prev = StateTable::zero(s);
        for j in 0..s {
            prev[j] = init * model.emission_log_pdf(j, &events[0]);
        }

        let mut backptr: Vec<Vec<u32>> = Vec::with_capacity(t_len);
        backptr.push(vec![NO_PREDECESSOR; s]);
        for t in 1..t_len {
            let mut cur = StateTable::zero(s);
            let mut bp = vec![NO_PREDECESSOR; s];
            for j in 0..s {
                let mut best = Prob::zero();
                let mut best_src = NO_PREDECESSOR;
                for (i, tp) in transitions.predecessors(j) {
                    let cand = prev[i] * tp;
                    if cand > best || (cand == best && (i as u32) < best_src) {
                        best = cand;
                        best_src = i as u32;
                    }
                }
                if best_src != NO_PREDECESSOR {
                    cur[j] = best * model.emission_log_pdf(j, &events[t]);
                    bp[j] = best_src;
                }
            }
            backptr.push(bp);
            prev = cur;
        }

        let (mut state, path_log_probability) = prev.max();
        let mut path = vec![0usize; t_len];
        for t in (0..t_len).rev() {
            path[t] = state;
            if t > 0 {
                let src = backptr[t][state];
                debug_assert!(src != NO_PREDECESSOR);
                state = src as usize;
            }
        }

        // spell the path: all k bases of the first state, then the bases
        // each transition newly introduces (a stay introduces none).
        let mut bases = space.decode(path[0]);
        for w in path.windows(2) {
            let n_new = space.n_new_bases(w[0], w[1]);
            bases.extend(space.last_bases(w[1], n_new));
        }
        let base_seq = String::from_utf8(bases).expect("decoded bases are ASCII");

        Viterbi {
            path,
            path_log_probability,
            base_seq,
        }
    }

    pub fn path_log_probability(&self) -> Prob {
        self.path_log_probability
    }
    pub fn state_path(&self) -> &[usize] {
        &self.path
    }
    pub fn base_seq(&self) -> &str {
        &self.base_seq
    }
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::kmer::KmerSpace;
    use crate::model::{ModelEntry, PoreModel};
    use crate::prob::log_normal_pdf;
    use approx::assert_abs_diff_eq;

    fn ev(mean: f64) -> Event {
        Event {
            mean,
            stdv: 0.0,
            start: 0.0,
            length: 0.01,
        }
    }

    /// 4 states (k=1) with well-separated level means and no stdv term.
    fn four_state_model() -> PoreModel {
        let space = KmerSpace::new(1);
        let states = (0..4)
            .map(|id| ModelEntry {
                level_mean: 50.0 + 10.0 * id as f64,
                level_stdv: 1.0,
                sd_mean: 0.0,
                sd_stdv: 0.0,
            })
            .collect();
        PoreModel::from_entries(space, states, 0).unwrap()
    }

    #[test]
    fn two_event_hand_computed_path() {
        let pm = four_state_model();
        // uniform transitions, fully connected
        let rows: String = (0..4)
            .flat_map(|i| (0..4).map(move |j| (i, j)))
            .map(|(i, j)| {
                format!(
                    "{} {} {}\n",
                    crate::kmer::BASES[i] as char,
                    crate::kmer::BASES[j] as char,
                    0.25f64.ln()
                )
            })
            .collect();
        let tr = Transitions::from_reader(rows.as_bytes(), "mem").unwrap();
        // events sit on the G level then the T level
        let events = EventSequence::new(vec![ev(70.2), ev(79.8)]);
        let vit = Viterbi::fill(&pm, &tr, &events);
        let g = pm.space().encode(b"G").unwrap();
        let t = pm.space().encode(b"T").unwrap();
        assert_eq!(vit.state_path(), &[g, t]);
        assert_eq!(vit.base_seq(), "GT");
        let expect = -(4.0f64.ln()) + log_normal_pdf(70.2, 70.0, 1.0).to_log_value()
            + 0.25f64.ln()
            + log_normal_pdf(79.8, 80.0, 1.0).to_log_value();
        assert_abs_diff_eq!(
            vit.path_log_probability().to_log_value(),
            expect,
            epsilon = 1e-10
        );
    }

    #[test]
    fn no_stay_matrix_walks_steps_only() {
        let space = KmerSpace::new(2);
        let states = (0..16)
            .map(|id| ModelEntry {
                level_mean: 50.0 + 3.0 * id as f64,
                level_stdv: 1.0,
                sd_mean: 0.0,
                sd_stdv: 0.0,
            })
            .collect();
        let pm = PoreModel::from_entries(space, states, 0).unwrap();
        let tr = Transitions::compute(space, 0.0, 0.0, 0.0);
        // events on the exact levels of the k-mer walk of "ACGTA"
        let walk = [b"AC", b"CG", b"GT", b"TA"];
        let events = EventSequence::new(
            walk.iter()
                .map(|km| {
                    let id = space.encode(&km[..]).unwrap();
                    ev(pm.entry(id).level_mean)
                })
                .collect(),
        );
        let vit = Viterbi::fill(&pm, &tr, &events);
        let expect: Vec<usize> = walk.iter().map(|km| space.encode(&km[..]).unwrap()).collect();
        assert_eq!(vit.state_path(), expect.as_slice());
        for w in vit.state_path().windows(2) {
            // every move is a one-step transition
            assert!(space.jumps(w[0], 1).any(|dst| dst == w[1]));
        }
        assert_eq!(vit.base_seq(), "ACGTA");
    }

    #[test]
    fn stays_emit_no_bases() {
        let pm = four_state_model();
        let space = pm.space();
        let tr = Transitions::compute(space, 0.0, 0.8, 0.0);
        // three events parked on the same level decode to a single base
        let events = EventSequence::new(vec![ev(60.0), ev(60.0), ev(60.0)]);
        let vit = Viterbi::fill(&pm, &tr, &events);
        let c = space.encode(b"C").unwrap();
        assert_eq!(vit.state_path(), &[c, c, c]);
        assert_eq!(vit.base_seq(), "C");
    }

    #[test]
    fn empty_events_decode_to_nothing() {
        let pm = four_state_model();
        let tr = Transitions::compute(pm.space(), 0.0, 0.1, 0.0);
        let vit = Viterbi::fill(&pm, &tr, &EventSequence::new(Vec::new()));
        assert!(vit.state_path().is_empty());
        assert_eq!(vit.base_seq(), "");
    }
}
