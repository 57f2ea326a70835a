//!
//! Sparse k-mer-to-k-mer transition probabilities.
//!
//! Stored as a directed graph over the 4^k states with log-probability edge
//! weights, so the forward pass can walk incoming edges of a state and the
//! backward pass outgoing edges without a second copy of the matrix.
//!

use crate::error::{Error, Result};
use crate::io::open_text;
use crate::kmer::KmerSpace;
use crate::prob::Prob;
use fnv::FnvHashMap;
use log::info;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::io::BufRead;
use std::path::Path;

///
/// The transition structure shared read-only by every DP invocation.
///
#[derive(Debug, Clone)]
pub struct Transitions {
    space: KmerSpace,
    graph: DiGraph<(), Prob>,
}

impl Transitions {
    ///
    /// Build from the three scalars:
    ///
    /// * `p_stay` mass on the self loop,
    /// * `1 - p_stay - p_skip` split over the 4 one-step successors,
    /// * skip-n mass `(1 - p_skip) * p_skip^n` split over the 4^(n+1)
    ///   n-skip destinations, for n = 1, 2, ...
    ///
    /// Masses landing on the same (src, dst) pair accumulate. Entries below
    /// `cutoff` are dropped and each row is renormalized to sum to 1.
    ///
    pub fn compute(space: KmerSpace, p_skip: f64, p_stay: f64, cutoff: f64) -> Transitions {
        let n = space.n_states();
        let mut graph = DiGraph::with_capacity(n, n * 8);
        for _ in 0..n {
            graph.add_node(());
        }
        let step_mass = (1.0 - p_stay - p_skip) / 4.0;
        for src in 0..n {
            let mut row: FnvHashMap<usize, f64> = FnvHashMap::default();
            if p_stay > 0.0 {
                *row.entry(src).or_insert(0.0) += p_stay;
            }
            if step_mass > 0.0 {
                for dst in space.jumps(src, 1) {
                    *row.entry(dst).or_insert(0.0) += step_mass;
                }
            }
            for n_skip in 1.. {
                let n_new = n_skip + 1;
                if n_new > space.k() {
                    break;
                }
                let per_dst = (1.0 - p_skip) * p_skip.powi(n_skip as i32)
                    / (1u64 << (2 * n_new)) as f64;
                if per_dst < cutoff.max(1e-12) {
                    break;
                }
                for dst in space.jumps(src, n_new) {
                    *row.entry(dst).or_insert(0.0) += per_dst;
                }
            }
            row.retain(|_, mass| *mass >= cutoff);
            let total: f64 = row.values().sum();
            let mut entries: Vec<(usize, f64)> = row.into_iter().collect();
            entries.sort_unstable_by_key(|&(dst, _)| dst);
            for (dst, mass) in entries {
                graph.add_edge(
                    NodeIndex::new(src),
                    NodeIndex::new(dst),
                    Prob::from_prob(mass / total),
                );
            }
        }
        Transitions { space, graph }
    }

    ///
    /// Load a custom table: rows `src_kmer dst_kmer log_p`, `#` headers
    /// tolerated, k inferred from the first row. Probabilities are taken as
    /// given, replacing the computed matrix entirely.
    ///
    pub fn from_reader(reader: impl BufRead, name: &str) -> Result<Transitions> {
        let mut space: Option<KmerSpace> = None;
        let mut graph = DiGraph::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::io(name, e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(Error::parse(
                    name,
                    lineno + 1,
                    format!("expected 3 fields, found {}", fields.len()),
                ));
            }
            if space.is_none() && !(1..=16).contains(&fields[0].len()) {
                return Err(Error::parse(
                    name,
                    lineno + 1,
                    format!("bad k-mer [{}]", fields[0]),
                ));
            }
            let sp = *space.get_or_insert_with(|| KmerSpace::new(fields[0].len()));
            if graph.node_count() == 0 {
                for _ in 0..sp.n_states() {
                    graph.add_node(());
                }
            }
            let src = sp.encode(fields[0].as_bytes()).ok_or_else(|| {
                Error::parse(name, lineno + 1, format!("bad k-mer [{}]", fields[0]))
            })?;
            let dst = sp.encode(fields[1].as_bytes()).ok_or_else(|| {
                Error::parse(name, lineno + 1, format!("bad k-mer [{}]", fields[1]))
            })?;
            let log_p: f64 = fields[2]
                .parse()
                .map_err(|_| Error::parse(name, lineno + 1, format!("bad number [{}]", fields[2])))?;
            graph.add_edge(
                NodeIndex::new(src),
                NodeIndex::new(dst),
                Prob::from_log_prob(log_p),
            );
        }
        let space = space.ok_or_else(|| Error::parse(name, 0, "empty transition file"))?;
        Ok(Transitions { space, graph })
    }

    pub fn from_file(path: &Path) -> Result<Transitions> {
        let reader = open_text(path)?;
        let t = Transitions::from_reader(reader, &path.display().to_string())?;
        info!("loaded state transitions from [{}]", path.display());
        Ok(t)
    }

    pub fn space(&self) -> KmerSpace {
        self.space
    }
    pub fn n_states(&self) -> usize {
        self.space.n_states()
    }
    pub fn n_edges(&self) -> usize {
        self.graph.edge_count()
    }
    ///
    /// States i with log_p(i -> j) present, with their transition prob.
    /// Drives the forward/Viterbi recurrences.
    ///
    pub fn predecessors(&self, j: usize) -> impl Iterator<Item = (usize, Prob)> + '_ {
        self.graph
            .edges_directed(NodeIndex::new(j), Direction::Incoming)
            .map(|e| (e.source().index(), *e.weight()))
    }
    ///
    /// States j with log_p(i -> j) present. Drives the backward pass.
    ///
    pub fn successors(&self, i: usize) -> impl Iterator<Item = (usize, Prob)> + '_ {
        self.graph
            .edges_directed(NodeIndex::new(i), Direction::Outgoing)
            .map(|e| (e.target().index(), *e.weight()))
    }
    ///
    /// Every stored (src, dst, log_p) triple.
    ///
    pub fn triples(&self) -> impl Iterator<Item = (usize, usize, Prob)> + '_ {
        self.graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index(), *e.weight()))
    }
    ///
    /// log_p(i -> j); p=0 when the transition was dropped or never existed.
    ///
    pub fn log_p(&self, i: usize, j: usize) -> Prob {
        self.graph
            .find_edge(NodeIndex::new(i), NodeIndex::new(j))
            .map(|e| self.graph[e])
            .unwrap_or_else(Prob::zero)
    }
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn row_sum(t: &Transitions, src: usize) -> f64 {
        t.successors(src).map(|(_, p)| p.to_value()).sum()
    }

    #[test]
    fn rows_sum_to_one_without_cutoff() {
        let space = KmerSpace::new(3);
        let t = Transitions::compute(space, 0.1, 0.1, 0.0);
        for src in 0..space.n_states() {
            assert_abs_diff_eq!(row_sum(&t, src), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn rows_sum_to_one_with_cutoff() {
        let space = KmerSpace::new(3);
        let t = Transitions::compute(space, 0.1, 0.1, 0.001);
        for src in 0..space.n_states() {
            assert_abs_diff_eq!(row_sum(&t, src), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn no_stay_no_skip_is_pure_step() {
        let space = KmerSpace::new(3);
        let t = Transitions::compute(space, 0.0, 0.0, 0.0);
        let acg = space.encode(b"ACG").unwrap();
        let succ: Vec<(usize, f64)> = t
            .successors(acg)
            .map(|(dst, p)| (dst, p.to_value()))
            .collect();
        assert_eq!(succ.len(), 4);
        for (dst, p) in succ {
            assert_abs_diff_eq!(p, 0.25, epsilon = 1e-12);
            assert_eq!(space.n_new_bases(acg, dst), 1);
        }
        // a homopolymer's four step successors include itself, still 1/4 each
        let aaa = space.encode(b"AAA").unwrap();
        assert_eq!(t.successors(aaa).count(), 4);
        assert_abs_diff_eq!(t.log_p(aaa, aaa).to_value(), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn cutoff_drops_skips() {
        let space = KmerSpace::new(4);
        // with a large cutoff only stay + step transitions survive
        let t = Transitions::compute(space, 0.1, 0.1, 0.01);
        let src = space.encode(b"ACGT").unwrap();
        for (dst, _) in t.successors(src) {
            assert!(space.n_new_bases(src, dst) <= 1);
        }
        assert_abs_diff_eq!(row_sum(&t, src), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn predecessors_mirror_successors() {
        let space = KmerSpace::new(2);
        let t = Transitions::compute(space, 0.15, 0.2, 0.0);
        for src in 0..space.n_states() {
            for (dst, p) in t.successors(src) {
                let found = t
                    .predecessors(dst)
                    .find(|&(i, _)| i == src)
                    .map(|(_, q)| q.to_log_value());
                assert_eq!(found, Some(p.to_log_value()));
            }
        }
        let n_from_triples = t.triples().count();
        assert_eq!(n_from_triples, t.n_edges());
    }

    #[test]
    fn custom_table_loads_verbatim() {
        let text = "\
# src dst log_p
AA AA -0.5
AA AC -1.5
CA AA -0.1
";
        let t = Transitions::from_reader(text.as_bytes(), "mem").unwrap();
        assert_eq!(t.space().k(), 2);
        let aa = t.space().encode(b"AA").unwrap();
        let ac = t.space().encode(b"AC").unwrap();
        let ca = t.space().encode(b"CA").unwrap();
        assert_abs_diff_eq!(t.log_p(aa, ac).to_log_value(), -1.5);
        assert_abs_diff_eq!(t.log_p(ca, aa).to_log_value(), -0.1);
        assert!(t.log_p(ac, aa).is_zero());
        assert_eq!(t.predecessors(aa).count(), 2);
    }
}
