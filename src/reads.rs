//!
//! Per-read summaries and the event-container reader.
//!
//! A container file carries one read: a `# read_id` header followed by one
//! event row per line, `strand mean stdv start length`, optionally gzipped.
//! Summaries are built once up front (header + bounds only); events are
//! loaded before a processing pass and dropped afterwards to bound memory.
//! Scaling parameters persist on the summary across passes.
//!

use crate::error::{Error, Result};
use crate::event::{Event, EventSequence};
use crate::io::open_text;
use crate::model::{ModelDict, ModelParams};
use fnv::FnvHashMap;
use log::warn;
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Per-strand (or joint, slot 2) parameter maps keyed by model name.
pub type ParamsMap = FnvHashMap<String, ModelParams>;

///
/// Quick validity check: the file opens and its first line is a
/// `# read_id` header. Directory scans use this to skip foreign files.
///
pub fn is_valid_event_file(path: &Path) -> bool {
    let Ok(reader) = open_text(path) else {
        return false;
    };
    match reader.lines().next() {
        Some(Ok(line)) => line.starts_with("# read_id"),
        _ => false,
    }
}

///
/// Everything the pipeline tracks for one read.
///
#[derive(Debug, Clone)]
pub struct ReadSummary {
    pub read_id: String,
    pub file_name: PathBuf,
    pub base_file_name: String,
    pub have_events: bool,
    /// [start0, end0, start1, end1] event indices per strand.
    pub strand_bounds: [usize; 4],
    /// Loaded lazily by `load_events`, emptied by `drop_events`.
    pub events: [EventSequence; 2],
    /// Scaling params per strand; slot 2 holds joint `"m0+m1"` entries.
    pub params: [ParamsMap; 3],
    /// Last measured fit per (strand, model), for the stats output.
    pub fits: [FnvHashMap<String, f64>; 3],
    pub preferred_model: [String; 2],
}

impl ReadSummary {
    ///
    /// Scan the container header and strand sizes, and seed the parameter
    /// maps so that the keys of `params[s]` enumerate the candidate model
    /// set of strand `s` (joint keys in slot 2 when scaling strands
    /// together). Persisted parameters from the `.params.json` sidecar
    /// override the identity seeds.
    ///
    pub fn new(
        path: &Path,
        models: &ModelDict,
        scale_strands_together: bool,
    ) -> Result<ReadSummary> {
        let display = path.display().to_string();
        let reader = open_text(path)?;
        let mut read_id = None;
        let mut n_events = [0usize; 2];
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::io(&display, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("# read_id") {
                read_id = Some(rest.trim().to_string());
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            let strand = parse_event_row(&display, lineno + 1, line)?.0;
            n_events[strand] += 1;
        }
        let read_id = read_id.ok_or_else(|| Error::parse(&display, 0, "missing read_id header"))?;

        let base_file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| display.clone());
        let mut summary = ReadSummary {
            read_id,
            file_name: path.to_path_buf(),
            base_file_name,
            have_events: n_events[0] + n_events[1] > 0,
            strand_bounds: [0, n_events[0], n_events[0], n_events[0] + n_events[1]],
            events: [EventSequence::default(), EventSequence::default()],
            params: Default::default(),
            fits: Default::default(),
            preferred_model: Default::default(),
        };

        let mut names: [Vec<&String>; 2] = Default::default();
        for st in 0..2 {
            for (name, model) in models.iter() {
                if model.strand() == st as u8 || model.strand() == 2 {
                    names[st].push(name);
                    summary.params[st].insert(name.clone(), ModelParams::default());
                }
            }
        }
        if scale_strands_together {
            for m0 in &names[0] {
                for m1 in &names[1] {
                    summary.params[2]
                        .insert(format!("{}+{}", m0, m1), ModelParams::default());
                }
            }
        }
        summary.load_persisted_params(path);
        Ok(summary)
    }

    ///
    /// Candidate models for one strand: the preferred model when it is set
    /// and known, otherwise every model applying to the strand, in name
    /// order.
    ///
    pub fn model_shortlist(&self, st: usize, models: &ModelDict) -> Vec<String> {
        if models.contains_key(&self.preferred_model[st]) {
            return vec![self.preferred_model[st].clone()];
        }
        let mut names: Vec<String> = models
            .iter()
            .filter(|(_, m)| m.strand() == st as u8 || m.strand() == 2)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    ///
    /// Populate `events[0..1]` from the container rows.
    ///
    pub fn load_events(&mut self) -> Result<()> {
        let display = self.file_name.display().to_string();
        let reader = open_text(&self.file_name)?;
        let mut events: [Vec<Event>; 2] = Default::default();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::io(&display, e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (strand, ev) = parse_event_row(&display, lineno + 1, line)?;
            events[strand].push(ev);
        }
        self.events = events.map(EventSequence::new);
        Ok(())
    }

    pub fn drop_events(&mut self) {
        self.events = [EventSequence::default(), EventSequence::default()];
    }

    ///
    /// One tab-separated stats record: identity, bounds, preferred models,
    /// then every (strand, model) with its final params and fit, in
    /// deterministic order.
    ///
    pub fn write_tsv(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        write!(
            w,
            "{}\t{}\t{}\t{} {} {} {}\t{}\t{}",
            self.read_id,
            self.base_file_name,
            self.have_events as u8,
            self.strand_bounds[0],
            self.strand_bounds[1],
            self.strand_bounds[2],
            self.strand_bounds[3],
            if self.preferred_model[0].is_empty() {
                "*"
            } else {
                self.preferred_model[0].as_str()
            },
            if self.preferred_model[1].is_empty() {
                "*"
            } else {
                self.preferred_model[1].as_str()
            },
        )?;
        for st in 0..3 {
            let mut names: Vec<&String> = self.params[st].keys().collect();
            names.sort_unstable();
            for name in names {
                let params = &self.params[st][name];
                let fit = self.fits[st]
                    .get(name)
                    .copied()
                    .unwrap_or(f64::NEG_INFINITY);
                write!(w, "\t{}:{}:{}:{}", st, name, params, fit)?;
            }
        }
        writeln!(w)
    }

    fn load_persisted_params(&mut self, path: &Path) {
        let sidecar = PathBuf::from(format!("{}.params.json", path.display()));
        if !sidecar.exists() {
            return;
        }
        let text = match std::fs::read_to_string(&sidecar) {
            Ok(t) => t,
            Err(e) => {
                warn!(
                    "ignoring unreadable params sidecar [{}]: {}",
                    sidecar.display(),
                    e
                );
                return;
            }
        };
        let parsed: std::result::Result<FnvHashMap<String, ParamsMap>, _> =
            serde_json::from_str(&text);
        match parsed {
            Ok(by_strand) => {
                for (strand, entries) in by_strand {
                    let Ok(st) = strand.parse::<usize>() else {
                        continue;
                    };
                    if st > 2 {
                        continue;
                    }
                    for (name, params) in entries {
                        // only seed known candidates
                        if let Some(slot) = self.params[st].get_mut(&name) {
                            *slot = params;
                        }
                    }
                }
            }
            Err(e) => warn!(
                "ignoring malformed params sidecar [{}]: {}",
                sidecar.display(),
                e
            ),
        }
    }
}

impl std::fmt::Display for ReadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "read [{}] file [{}] have_events [{}] strand_bounds [{} {} {} {}]",
            self.read_id,
            self.base_file_name,
            self.have_events as u8,
            self.strand_bounds[0],
            self.strand_bounds[1],
            self.strand_bounds[2],
            self.strand_bounds[3],
        )
    }
}

fn parse_event_row(path: &str, lineno: usize, line: &str) -> Result<(usize, Event)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::parse(
            path,
            lineno,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }
    let strand: usize = match fields[0] {
        "0" => 0,
        "1" => 1,
        other => {
            return Err(Error::parse(path, lineno, format!("bad strand [{}]", other)));
        }
    };
    let mut vals = [0.0f64; 4];
    for (v, s) in vals.iter_mut().zip(&fields[1..]) {
        *v = s
            .parse()
            .map_err(|_| Error::parse(path, lineno, format!("bad number [{}]", s)))?;
        if !v.is_finite() {
            return Err(Error::parse(path, lineno, format!("non-finite value [{}]", s)));
        }
    }
    Ok((
        strand,
        Event {
            mean: vals[0],
            stdv: vals[1],
            start: vals[2],
            length: vals[3],
        },
    ))
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::KmerSpace;
    use crate::model::{ModelEntry, PoreModel};

    fn two_models() -> ModelDict {
        let space = KmerSpace::new(1);
        let entries: Vec<ModelEntry> = (0..4)
            .map(|id| ModelEntry {
                level_mean: 50.0 + 10.0 * id as f64,
                level_stdv: 1.0,
                sd_mean: 1.0,
                sd_stdv: 0.2,
            })
            .collect();
        let mut models = ModelDict::default();
        let mut t = PoreModel::from_entries(space, entries.clone(), 2).unwrap();
        t.set_strand(0);
        models.insert("tmpl".to_string(), t);
        let mut c = PoreModel::from_entries(space, entries, 2).unwrap();
        c.set_strand(1);
        models.insert("comp".to_string(), c);
        models
    }

    fn write_container(dir: &Path, name: &str, n0: usize, n1: usize) -> PathBuf {
        let path = dir.join(name);
        let mut text = String::from("# read_id r1\n");
        for i in 0..n0 {
            text.push_str(&format!(
                "0\t{}\t1.0\t{}\t0.01\n",
                60.0 + i as f64,
                i as f64 * 0.01
            ));
        }
        for i in 0..n1 {
            text.push_str(&format!(
                "1\t{}\t1.0\t{}\t0.01\n",
                55.0 + i as f64,
                i as f64 * 0.01
            ));
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn summary_counts_and_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_container(dir.path(), "r1.events", 3, 2);
        assert!(is_valid_event_file(&path));
        let models = two_models();
        let s = ReadSummary::new(&path, &models, false).unwrap();
        assert_eq!(s.read_id, "r1");
        assert!(s.have_events);
        assert_eq!(s.strand_bounds, [0, 3, 3, 5]);
        // candidate sets per strand
        assert_eq!(s.params[0].len(), 1);
        assert!(s.params[0].contains_key("tmpl"));
        assert!(s.params[1].contains_key("comp"));
        assert!(s.params[2].is_empty());
        assert_eq!(s.model_shortlist(0, &models), vec!["tmpl".to_string()]);
    }

    #[test]
    fn joint_keys_when_scaling_together() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_container(dir.path(), "r1.events", 2, 2);
        let models = two_models();
        let s = ReadSummary::new(&path, &models, true).unwrap();
        assert_eq!(s.params[2].len(), 1);
        assert!(s.params[2].contains_key("tmpl+comp"));
    }

    #[test]
    fn load_and_drop_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_container(dir.path(), "r1.events", 3, 2);
        let models = two_models();
        let mut s = ReadSummary::new(&path, &models, false).unwrap();
        assert!(s.events[0].is_empty());
        s.load_events().unwrap();
        assert_eq!(s.events[0].len(), 3);
        assert_eq!(s.events[1].len(), 2);
        assert_eq!(s.events[1][0].mean, 55.0);
        s.drop_events();
        assert!(s.events[0].is_empty() && s.events[1].is_empty());
    }

    #[test]
    fn persisted_params_seed_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_container(dir.path(), "r1.events", 2, 0);
        let sidecar = format!("{}.params.json", path.display());
        std::fs::write(
            &sidecar,
            r#"{"0": {"tmpl": {"shift": 2.5, "scale": 1.1, "drift": 0.0, "var": 1.0, "scale_sd": 1.0, "var_sd": 1.0}, "unknown": {"shift": 9.0, "scale": 1.0, "drift": 0.0, "var": 1.0, "scale_sd": 1.0, "var_sd": 1.0}}}"#,
        )
        .unwrap();
        let models = two_models();
        let s = ReadSummary::new(&path, &models, false).unwrap();
        assert_eq!(s.params[0]["tmpl"].shift, 2.5);
        // unknown model names are not added to the candidate set
        assert!(!s.params[0].contains_key("unknown"));
    }

    #[test]
    fn invalid_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_events.txt");
        std::fs::write(&path, "hello\n").unwrap();
        assert!(!is_valid_event_file(&path));
        let bad = dir.path().join("bad.events");
        std::fs::write(&bad, "# read_id r2\n2\t60.0\t1.0\t0.0\t0.01\n").unwrap();
        let models = two_models();
        assert!(ReadSummary::new(&bad, &models, false).is_err());
    }
}
