//!
//! The two passes over the read set.
//!
//! Pass A refines per-read scaling parameters (and may pick a preferred
//! model per strand); Pass B decodes each strand with every shortlisted
//! model and emits the best basecall as FASTA. Both passes run reads in
//! parallel through `pfor`, so models and transitions are shared read-only
//! and each worker owns exactly one `ReadSummary` at a time.
//!

use crate::event::EventSequence;
use crate::hmm::Viterbi;
use crate::io::write_fasta;
use crate::model::ModelDict;
use crate::pfor::pfor;
use crate::reads::ReadSummary;
use crate::trainer::{converge, train_one_round};
use crate::transitions::Transitions;
use itertools::iproduct;
use log::{debug, info, warn};
use std::io::Write;

///
/// Knobs shared by both passes; defaults follow the command-line defaults.
///
#[derive(Debug, Clone)]
pub struct PipelineOpts {
    pub min_read_len: usize,
    pub fasta_line_width: usize,
    pub scale_num_events: usize,
    pub scale_max_rounds: u32,
    pub scale_min_fit_progress: f64,
    pub scale_strands_together: bool,
    pub scale_select_model_single_round: bool,
    pub threads: usize,
    pub chunk_size: usize,
}

impl Default for PipelineOpts {
    fn default() -> PipelineOpts {
        PipelineOpts {
            min_read_len: 1000,
            fasta_line_width: 80,
            scale_num_events: 200,
            scale_max_rounds: 10,
            scale_min_fit_progress: 1.0,
            scale_strands_together: false,
            scale_select_model_single_round: false,
            threads: 1,
            chunk_size: 10,
        }
    }
}

fn report_progress(items: u64, seconds: u64) {
    eprint!("Processed {:6} reads in {:6} seconds\r", items, seconds);
}

///
/// The two training slices for one strand: a prefix and a suffix of at most
/// `scale_num_events / 2` events each (they may overlap on short strands).
///
fn training_slices(events: &EventSequence, scale_num_events: usize) -> [EventSequence; 2] {
    let n = scale_num_events.min(events.len());
    [events.prefix(n / 2), events.suffix(n / 2)]
}

///
/// Pass A: per-read parameter training.
///
/// With `scale_strands_together` and both strands long enough, the
/// Cartesian product of the per-strand shortlists is trained jointly under
/// keys `"m0+m1"`, and a preferred model pair is *always* selected after
/// round 0 (the single-round flag is effectively ignored on this path).
/// Otherwise strands train independently and selection only happens when
/// `scale_select_model_single_round` is set.
///
/// `scale_max_rounds == 0` leaves every parameter untouched.
///
pub fn rescale_reads(
    models: &ModelDict,
    transitions: &Transitions,
    reads: &mut [ReadSummary],
    opts: &PipelineOpts,
) {
    if opts.scale_max_rounds == 0 {
        return;
    }
    let mut iter = reads.iter_mut();
    pfor(
        opts.threads,
        opts.chunk_size,
        move || iter.next(),
        |read, _: &mut ()| rescale_one(models, transitions, read, opts),
        |_| {},
        report_progress,
    );
    eprintln!();
}

fn rescale_one(
    models: &ModelDict,
    transitions: &Transitions,
    read: &mut ReadSummary,
    opts: &PipelineOpts,
) {
    if let Err(e) = read.load_events() {
        warn!("skipping read [{}]: {}", read.read_id, e);
        return;
    }
    let n_events = [read.events[0].len(), read.events[1].len()];
    let qualifies = |st: usize| -> bool { n_events[st] >= opts.min_read_len };
    let shortlists: [Vec<String>; 2] =
        [read.model_shortlist(0, models), read.model_shortlist(1, models)];
    let slices: [[EventSequence; 2]; 2] = [
        training_slices(&read.events[0], opts.scale_num_events),
        training_slices(&read.events[1], opts.scale_num_events),
    ];

    if opts.scale_strands_together
        && qualifies(0)
        && qualifies(1)
        && !shortlists[0].is_empty()
        && !shortlists[1].is_empty()
    {
        let seqs: Vec<&EventSequence> = vec![
            &slices[0][0],
            &slices[0][1],
            &slices[1][0],
            &slices[1][1],
        ];
        // round 0 over the full product of shortlists
        let mut model_fit: Vec<((&String, &String), f64)> = Vec::new();
        for (m0, m1) in iproduct!(&shortlists[0], &shortlists[1]) {
            let key = format!("{}+{}", m0, m1);
            let bundle_models = vec![&models[m0], &models[m0], &models[m1], &models[m1]];
            let old = read.params[2][&key];
            let out = train_one_round(&seqs, &bundle_models, transitions, &old);
            debug!(
                "scaling_round read [{}] strand [2] model [{}] old_params [{}] old_fit [-inf] crt_params [{}] crt_fit [{}] round [0]",
                read.read_id, key, old, out.params, out.fit
            );
            read.params[2].insert(key.clone(), out.params);
            read.fits[2].insert(key, out.fit);
            model_fit.push(((m0, m1), out.fit));
        }
        // always select the best pair here, flag or not
        let &((m0, m1), fit0) = model_fit
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .expect("non-empty shortlist product");
        read.preferred_model[0] = m0.clone();
        read.preferred_model[1] = m1.clone();
        debug!(
            "selected_model read [{}] strand [2] model [{}+{}]",
            read.read_id, m0, m1
        );
        // remaining rounds on the selected pair
        let key = format!("{}+{}", m0, m1);
        let bundle_models = vec![&models[m0], &models[m0], &models[m1], &models[m1]];
        let ctx = format!("read [{}] strand [2] model [{}]", read.read_id, key);
        let (params, fit, _) = converge(
            &seqs,
            &bundle_models,
            transitions,
            read.params[2][&key],
            fit0,
            opts.scale_max_rounds,
            opts.scale_min_fit_progress,
            &ctx,
        );
        read.params[2].insert(key.clone(), params);
        read.fits[2].insert(key, fit);
        read.params[0].insert(m0.clone(), params);
        read.params[1].insert(m1.clone(), params);
        read.fits[0].insert(m0.clone(), fit);
        read.fits[1].insert(m1.clone(), fit);
    } else {
        for st in 0..2 {
            if !qualifies(st) || shortlists[st].is_empty() {
                continue;
            }
            let seqs: Vec<&EventSequence> = vec![&slices[st][0], &slices[st][1]];
            // round 0 per candidate model
            let mut model_fit: Vec<(&String, f64)> = Vec::new();
            for m in &shortlists[st] {
                let bundle_models = vec![&models[m], &models[m]];
                let old = read.params[st][m];
                let out = train_one_round(&seqs, &bundle_models, transitions, &old);
                debug!(
                    "scaling_round read [{}] strand [{}] model [{}] old_params [{}] old_fit [-inf] crt_params [{}] crt_fit [{}] round [0]",
                    read.read_id, st, m, old, out.params, out.fit
                );
                read.params[st].insert(m.clone(), out.params);
                read.fits[st].insert(m.clone(), out.fit);
                model_fit.push((m, out.fit));
            }
            let selected: Vec<&String> = if opts.scale_select_model_single_round {
                let &(best, _) = model_fit
                    .iter()
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .expect("non-empty shortlist");
                read.preferred_model[st] = best.clone();
                debug!(
                    "selected_model read [{}] strand [{}] model [{}]",
                    read.read_id, st, best
                );
                vec![best]
            } else {
                shortlists[st].iter().collect()
            };
            // remaining rounds per retained model
            for m in selected {
                let bundle_models = vec![&models[m], &models[m]];
                let fit0 = model_fit
                    .iter()
                    .find(|(name, _)| *name == m)
                    .map(|&(_, fit)| fit)
                    .expect("round 0 ran for every candidate");
                let ctx = format!("read [{}] strand [{}] model [{}]", read.read_id, st, m);
                let (params, fit, _) = converge(
                    &seqs,
                    &bundle_models,
                    transitions,
                    read.params[st][m],
                    fit0,
                    opts.scale_max_rounds,
                    opts.scale_min_fit_progress,
                    &ctx,
                );
                read.params[st].insert(m.clone(), params);
                read.fits[st].insert(m.clone(), fit);
            }
        }
    }
    read.drop_events();
}

///
/// Pass B: basecalling. Decodes each qualifying strand with every model on
/// its shortlist, keeps the highest path probability, updates the preferred
/// model, and emits `><read_id>:<source_file>:<strand>` FASTA records in
/// read order.
///
pub fn basecall_reads(
    models: &ModelDict,
    transitions: &Transitions,
    reads: &mut [ReadSummary],
    opts: &PipelineOpts,
    out: &mut (dyn Write + Send),
) {
    let mut iter = reads.iter_mut();
    pfor(
        opts.threads,
        opts.chunk_size,
        move || iter.next(),
        |read, acc: &mut Vec<u8>| basecall_one(models, transitions, read, opts, acc),
        |acc| {
            out.write_all(&acc).expect("writing sequence output");
        },
        report_progress,
    );
    eprintln!();
}

fn basecall_one(
    models: &ModelDict,
    transitions: &Transitions,
    read: &mut ReadSummary,
    opts: &PipelineOpts,
    acc: &mut Vec<u8>,
) {
    if let Err(e) = read.load_events() {
        warn!("skipping read [{}]: {}", read.read_id, e);
        return;
    }
    for st in 0..2 {
        if read.events[st].len() < opts.min_read_len {
            continue;
        }
        let shortlist = read.model_shortlist(st, models);
        if shortlist.is_empty() {
            continue;
        }
        let (ev_mean, ev_stdv) = read.events[st].mean_stdv();
        debug!(
            "mean_stdv read [{}] strand [{}] ev_mean=[{}] ev_stdv=[{}]",
            read.read_id, st, ev_mean, ev_stdv
        );
        let mut results: Vec<(f64, String, String)> = Vec::new();
        for m_name in shortlist {
            let params = *read.params[st]
                .get(&m_name)
                .expect("shortlist keys always carry params");
            let scaled = models[&m_name].scale(&params);
            info!(
                "basecalling read [{}] strand [{}] model [{}] parameters [{}]",
                read.read_id, st, m_name, params
            );
            debug!(
                "mean_stdv read [{}] strand [{}] model_mean [{}] model_stdv [{}]",
                read.read_id,
                st,
                scaled.mean(),
                scaled.stdv()
            );
            if (ev_mean - scaled.mean()).abs() > 5.0 {
                warn!(
                    "means_apart read [{}] strand [{}] model [{}] parameters [{}] model_mean=[{}] events_mean=[{}]",
                    read.read_id,
                    st,
                    m_name,
                    params,
                    scaled.mean(),
                    ev_mean
                );
            }
            let mut corrected = read.events[st].clone();
            corrected.apply_drift_correction(params.drift);
            let vit = Viterbi::fill(&scaled, transitions, &corrected);
            results.push((
                vit.path_log_probability().to_log_value(),
                m_name,
                vit.base_seq().to_string(),
            ));
        }
        results.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let (_, best_m_name, base_seq) = results.last().expect("non-empty shortlist");
        info!(
            "best_model read [{}] strand [{}] model [{}] parameters [{}]",
            read.read_id, st, best_m_name, read.params[st][best_m_name]
        );
        read.preferred_model[st] = best_m_name.clone();
        let header = format!("{}:{}:{}", read.read_id, read.base_file_name, st);
        write_fasta(acc, &header, base_seq, opts.fasta_line_width)
            .expect("writing to an in-memory buffer");
    }
    read.drop_events();
}
