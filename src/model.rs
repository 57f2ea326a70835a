//!
//! Pore models: per-k-mer emission distributions and their per-read scaling
//! parameters.
//!
//! A model row gives the expected level mean/stdv and the expected
//! within-event stdv mean/stdv for one k-mer. Scaling maps a generic model
//! onto one read's current range; drift is applied to events instead, see
//! `EventSequence`.
//!

use crate::error::{Error, Result};
use crate::event::Event;
use crate::io::open_text;
use crate::kmer::KmerSpace;
use crate::prob::{log_normal_pdf, Prob};
use fnv::FnvHashMap;
use log::info;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::io::Write;
use std::path::Path;

/// Strand tag: 0 = template, 1 = complement, 2 = either.
pub type Strand = u8;

///
/// Per-read scaling parameters.
///
/// Emissions scale as `mu' = scale * mu + shift`, `sigma' = var * sigma`,
/// `mu_sd' = scale_sd * mu_sd`, `sigma_sd' = var_sd * sigma_sd`; drift is
/// subtracted from event means per unit start time.
///
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub shift: f64,
    pub scale: f64,
    pub drift: f64,
    pub var: f64,
    pub scale_sd: f64,
    pub var_sd: f64,
}

impl Default for ModelParams {
    /// The identity scaling (0, 1, 0, 1, 1, 1).
    fn default() -> ModelParams {
        ModelParams {
            shift: 0.0,
            scale: 1.0,
            drift: 0.0,
            var: 1.0,
            scale_sd: 1.0,
            var_sd: 1.0,
        }
    }
}

impl ModelParams {
    pub fn is_finite(&self) -> bool {
        self.shift.is_finite()
            && self.scale.is_finite()
            && self.drift.is_finite()
            && self.var.is_finite()
            && self.scale_sd.is_finite()
            && self.var_sd.is_finite()
    }
}

impl std::fmt::Display for ModelParams {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.shift, self.scale, self.drift, self.var, self.scale_sd, self.var_sd
        )
    }
}

///
/// One model row: emission parameters of a single k-mer state.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelEntry {
    /// expected level mean (pA)
    pub level_mean: f64,
    /// level spread across reads
    pub level_stdv: f64,
    /// expected within-event stdv
    pub sd_mean: f64,
    /// spread of the within-event stdv; 0 disables the stdv emission term
    pub sd_stdv: f64,
}

///
/// A pore model over the 4^k k-mer state space.
///
#[derive(Debug, Clone)]
pub struct PoreModel {
    space: KmerSpace,
    states: Vec<ModelEntry>,
    strand: Strand,
    mean: f64,
    stdv: f64,
}

impl PoreModel {
    ///
    /// Build from per-state entries in id order.
    ///
    pub fn from_entries(space: KmerSpace, states: Vec<ModelEntry>, strand: Strand) -> Result<PoreModel> {
        if states.len() != space.n_states() {
            return Err(Error::config(format!(
                "model has {} states, expected 4^{} = {}",
                states.len(),
                space.k(),
                space.n_states()
            )));
        }
        if let Some(i) = states.iter().position(|e| !(e.level_stdv > 0.0)) {
            return Err(Error::config(format!(
                "model state {} has level_stdv <= 0",
                i
            )));
        }
        if let Some(i) = states.iter().position(|e| e.sd_stdv < 0.0) {
            return Err(Error::config(format!("model state {} has sd_stdv < 0", i)));
        }
        let mut pm = PoreModel {
            space,
            states,
            strand,
            mean: 0.0,
            stdv: 0.0,
        };
        pm.update_statistics();
        Ok(pm)
    }
    ///
    /// Parse the one-row-per-k-mer text format:
    /// `kmer level_mean level_stdv sd_mean sd_stdv`, `#` headers tolerated,
    /// k inferred from the first row. Rows may come in any order but must
    /// cover every k-mer exactly once.
    ///
    pub fn from_reader(reader: impl BufRead, name: &str) -> Result<PoreModel> {
        let mut space: Option<KmerSpace> = None;
        let mut states: Vec<Option<ModelEntry>> = Vec::new();
        let mut n_rows = 0;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::io(name, e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(Error::parse(
                    name,
                    lineno + 1,
                    format!("expected 5 fields, found {}", fields.len()),
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
            let id = sp.encode(fields[0].as_bytes()).ok_or_else(|| {
                Error::parse(name, lineno + 1, format!("bad k-mer [{}]", fields[0]))
            })?;
            let mut vals = [0.0f64; 4];
            for (v, s) in vals.iter_mut().zip(&fields[1..]) {
                *v = s
                    .parse()
                    .map_err(|_| Error::parse(name, lineno + 1, format!("bad number [{}]", s)))?;
                if !v.is_finite() {
                    return Err(Error::parse(name, lineno + 1, format!("non-finite value [{}]", s)));
                }
            }
            if states.is_empty() {
                states.resize(sp.n_states(), None);
            }
            states[id] = Some(ModelEntry {
                level_mean: vals[0],
                level_stdv: vals[1],
                sd_mean: vals[2],
                sd_stdv: vals[3],
            });
            n_rows += 1;
        }
        let space = space.ok_or_else(|| Error::parse(name, 0, "empty model file"))?;
        if n_rows != space.n_states() || states.iter().any(|s| s.is_none()) {
            return Err(Error::parse(
                name,
                0,
                format!("{} rows for k={}, expected {}", n_rows, space.k(), space.n_states()),
            ));
        }
        let states = states.into_iter().map(|s| s.unwrap()).collect();
        PoreModel::from_entries(space, states, 2)
    }
    ///
    /// Load from a (possibly gzipped) file.
    ///
    pub fn from_file(path: &Path) -> Result<PoreModel> {
        let reader = open_text(path)?;
        PoreModel::from_reader(reader, &path.display().to_string())
    }
    ///
    /// Serialize in the same format `from_reader` parses. Floats print with
    /// the shortest round-trip representation, so load(write(m)) == m.
    ///
    pub fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        writeln!(w, "#kmer\tlevel_mean\tlevel_stdv\tsd_mean\tsd_stdv")?;
        for (id, e) in self.states.iter().enumerate() {
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}",
                String::from_utf8_lossy(&self.space.decode(id)),
                e.level_mean,
                e.level_stdv,
                e.sd_mean,
                e.sd_stdv
            )?;
        }
        Ok(())
    }

    pub fn space(&self) -> KmerSpace {
        self.space
    }
    pub fn k(&self) -> usize {
        self.space.k()
    }
    pub fn n_states(&self) -> usize {
        self.space.n_states()
    }
    pub fn entry(&self, state: usize) -> &ModelEntry {
        &self.states[state]
    }
    pub fn strand(&self) -> Strand {
        self.strand
    }
    pub fn set_strand(&mut self, strand: Strand) {
        self.strand = strand;
    }
    /// Mean of the per-k-mer level means.
    pub fn mean(&self) -> f64 {
        self.mean
    }
    /// Stdv of the per-k-mer level means.
    pub fn stdv(&self) -> f64 {
        self.stdv
    }

    fn update_statistics(&mut self) {
        let n = self.states.len() as f64;
        let mean = self.states.iter().map(|e| e.level_mean).sum::<f64>() / n;
        let var = self
            .states
            .iter()
            .map(|e| (e.level_mean - mean) * (e.level_mean - mean))
            .sum::<f64>()
            / n;
        self.mean = mean;
        self.stdv = var.sqrt();
    }

    ///
    /// A scaled copy; `self` is untouched.
    ///
    pub fn scale(&self, params: &ModelParams) -> PoreModel {
        let states = self
            .states
            .iter()
            .map(|e| ModelEntry {
                level_mean: params.scale * e.level_mean + params.shift,
                level_stdv: params.var * e.level_stdv,
                sd_mean: params.scale_sd * e.sd_mean,
                sd_stdv: params.var_sd * e.sd_stdv,
            })
            .collect();
        let mut pm = PoreModel {
            space: self.space,
            states,
            strand: self.strand,
            mean: 0.0,
            stdv: 0.0,
        };
        pm.update_statistics();
        pm
    }

    ///
    /// log P(event | state): a normal density on the event mean, times one
    /// on the event stdv when the model resolves it (sd_stdv > 0).
    ///
    pub fn emission_log_pdf(&self, state: usize, ev: &Event) -> Prob {
        let e = &self.states[state];
        let level = log_normal_pdf(ev.mean, e.level_mean, e.level_stdv);
        if e.sd_stdv > 0.0 {
            level * log_normal_pdf(ev.stdv, e.sd_mean, e.sd_stdv)
        } else {
            level
        }
    }
}

/// Models keyed by name, shared read-only across the pipeline.
pub type ModelDict = FnvHashMap<String, PoreModel>;

//
// built-in models
//

const BUILTIN_MODELS: &[(&str, Strand, &str)] = &[
    (
        "r7.3_template_median68pA",
        0,
        include_str!("../models/r7.3_template_median68pA.model"),
    ),
    (
        "r7.3_complement_median68pA_pop1",
        1,
        include_str!("../models/r7.3_complement_median68pA_pop1.model"),
    ),
    (
        "r7.3_complement_median68pA_pop2",
        1,
        include_str!("../models/r7.3_complement_median68pA_pop2.model"),
    ),
];

///
/// The bundled level tables, used when no models are given on the command
/// line.
///
pub fn builtin_models() -> Result<ModelDict> {
    let mut models = ModelDict::default();
    for &(name, strand, text) in BUILTIN_MODELS {
        let mut pm = PoreModel::from_reader(text.as_bytes(), name)?;
        pm.set_strand(strand);
        info!(
            "loaded builtin model [{}] for strand [{}] statistics [mean={:.2}, stdv={:.2}]",
            name,
            strand,
            pm.mean(),
            pm.stdv()
        );
        models.insert(name.to_string(), pm);
    }
    Ok(models)
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::prob::log_normal_pdf;

    pub(crate) fn uniform_model(k: usize, strand: Strand) -> PoreModel {
        let space = KmerSpace::new(k);
        let states = (0..space.n_states())
            .map(|id| ModelEntry {
                level_mean: 50.0 + id as f64,
                level_stdv: 1.0 + 0.01 * id as f64,
                sd_mean: 1.5,
                sd_stdv: 0.3,
            })
            .collect();
        PoreModel::from_entries(space, states, strand).unwrap()
    }

    #[test]
    fn parse_roundtrip_is_bit_identical() {
        let pm = uniform_model(2, 0);
        let mut buf = Vec::new();
        pm.write(&mut buf).unwrap();
        let pm2 = PoreModel::from_reader(buf.as_slice(), "mem").unwrap();
        for id in 0..pm.n_states() {
            assert_eq!(pm.entry(id), pm2.entry(id));
        }
        // and a second write is byte-identical
        let mut buf2 = Vec::new();
        pm2.write(&mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn builtin_models_load_and_roundtrip() {
        let models = builtin_models().unwrap();
        assert_eq!(models.len(), 3);
        let pm = &models["r7.3_template_median68pA"];
        assert_eq!(pm.k(), 6);
        assert_eq!(pm.strand(), 0);
        assert!(pm.mean() > 50.0 && pm.mean() < 90.0);
        // write/reload is bit-identical at k=6
        let mut buf = Vec::new();
        pm.write(&mut buf).unwrap();
        let pm2 = PoreModel::from_reader(buf.as_slice(), "mem").unwrap();
        for id in [0usize, 1, 255, 4095] {
            assert_eq!(pm.entry(id), pm2.entry(id));
        }
        let mut buf2 = Vec::new();
        pm2.write(&mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn parse_rejects_malformed_rows() {
        let text = "AC 1.0 1.0 1.0\n";
        assert!(PoreModel::from_reader(text.as_bytes(), "mem").is_err());
        let text = "AC 1.0 1.0 1.0 nan\n";
        assert!(PoreModel::from_reader(text.as_bytes(), "mem").is_err());
        let text = "AX 1.0 1.0 1.0 0.1\n";
        assert!(PoreModel::from_reader(text.as_bytes(), "mem").is_err());
        // wrong row count for k=2
        let text = "AA 60.0 1.0 1.5 0.1\nAC 61.0 1.0 1.5 0.1\n";
        assert!(PoreModel::from_reader(text.as_bytes(), "mem").is_err());
    }

    #[test]
    fn zero_level_stdv_is_rejected() {
        let space = KmerSpace::new(1);
        let states = vec![
            ModelEntry {
                level_mean: 60.0,
                level_stdv: 0.0,
                sd_mean: 1.0,
                sd_stdv: 0.1,
            };
            4
        ];
        assert!(PoreModel::from_entries(space, states, 0).is_err());
    }

    #[test]
    fn identity_scaling_is_noop_on_emissions() {
        let pm = uniform_model(2, 0);
        let scaled = pm.scale(&ModelParams::default());
        let ev = Event {
            mean: 55.0,
            stdv: 1.4,
            start: 0.0,
            length: 0.01,
        };
        for id in 0..pm.n_states() {
            assert_abs_diff_eq!(
                pm.emission_log_pdf(id, &ev).to_log_value(),
                scaled.emission_log_pdf(id, &ev).to_log_value()
            );
        }
    }

    #[test]
    fn scaling_transforms_entries() {
        let pm = uniform_model(1, 0);
        let params = ModelParams {
            shift: 2.0,
            scale: 1.5,
            drift: 0.0,
            var: 2.0,
            scale_sd: 0.5,
            var_sd: 3.0,
        };
        let sc = pm.scale(&params);
        let e = pm.entry(2);
        let s = sc.entry(2);
        assert_abs_diff_eq!(s.level_mean, 1.5 * e.level_mean + 2.0);
        assert_abs_diff_eq!(s.level_stdv, 2.0 * e.level_stdv);
        assert_abs_diff_eq!(s.sd_mean, 0.5 * e.sd_mean);
        assert_abs_diff_eq!(s.sd_stdv, 3.0 * e.sd_stdv);
        // original untouched
        assert_abs_diff_eq!(pm.entry(2).level_mean, 52.0);
    }

    #[test]
    fn emission_drops_sd_term_when_unresolved() {
        let space = KmerSpace::new(1);
        let states = vec![
            ModelEntry {
                level_mean: 60.0,
                level_stdv: 2.0,
                sd_mean: 1.0,
                sd_stdv: 0.0,
            };
            4
        ];
        let pm = PoreModel::from_entries(space, states, 0).unwrap();
        let ev = Event {
            mean: 61.0,
            stdv: 5.0,
            start: 0.0,
            length: 0.01,
        };
        assert_abs_diff_eq!(
            pm.emission_log_pdf(0, &ev).to_log_value(),
            log_normal_pdf(61.0, 60.0, 2.0).to_log_value()
        );
    }
}
