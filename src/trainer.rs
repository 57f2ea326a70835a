//!
//! Per-read scaling: one EM round and the convergence driver.
//!
//! A round runs forward/backward under the current parameters, then solves
//! γ-weighted normal equations for new ones. The fit reported by a round is
//! the likelihood of the parameters it was *given*, so the convergence loop
//! watches fits with a one-round lag and reverts when they regress.
//!

use crate::event::EventSequence;
use crate::hmm::ForwardBackward;
use crate::model::{ModelParams, PoreModel};
use crate::transitions::Transitions;
use log::{debug, info};

/// Posterior weights below this contribute nothing and are skipped.
const MIN_WEIGHT: f64 = 1e-10;

///
/// Result of one training round.
///
/// `done` signals a singularity (zero-weight column, degenerate design,
/// empty likelihood): the round is discarded and `params` echoes the input.
///
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub params: ModelParams,
    pub fit: f64,
    pub done: bool,
}

fn discard(old_params: &ModelParams, fit: f64) -> TrainOutcome {
    TrainOutcome {
        params: *old_params,
        fit,
        done: true,
    }
}

///
/// Solve the symmetric 3x3 system `a x = b` by Cramer's rule.
/// None when the determinant vanishes or the solution is not finite.
///
fn solve3(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let det = |m: &[[f64; 3]; 3]| -> f64 {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let d = det(a);
    if d == 0.0 || !d.is_finite() {
        return None;
    }
    let mut x = [0.0; 3];
    for col in 0..3 {
        let mut m = *a;
        for row in 0..3 {
            m[row][col] = b[row];
        }
        x[col] = det(&m) / d;
        if !x[col].is_finite() {
            return None;
        }
    }
    Some(x)
}

///
/// One EM round over a bundle of training event sequences and their models
/// (parallel slices; when scaling strands together the first half shares
/// model 0 and the second half model 1).
///
/// 1. Scale each model by `old_params`, drift-correct a fresh copy of each
///    event sequence, run forward/backward; fit = Σ Z.
/// 2. Accumulate γ-weighted sufficient statistics: a joint weighted
///    regression of raw event means on (1, μ_i, start) for
///    (shift, scale, drift); a no-intercept regression of event stdv on
///    μ_sd for scale_sd; γ-weighted observed/expected residual ratios for
///    var and var_sd.
/// 3. Solve; any non-finite coefficient sets `done` and keeps `old_params`.
///
pub fn train_one_round(
    event_seqs: &[&EventSequence],
    models: &[&PoreModel],
    transitions: &Transitions,
    old_params: &ModelParams,
) -> TrainOutcome {
    assert_eq!(event_seqs.len(), models.len());
    assert!(!event_seqs.is_empty());

    let mut fit = 0.0;
    let mut fwbws = Vec::with_capacity(event_seqs.len());
    for (&events, &model) in event_seqs.iter().zip(models.iter()) {
        let scaled = model.scale(old_params);
        let mut corrected = events.clone();
        corrected.apply_drift_correction(old_params.drift);
        let fb = ForwardBackward::fill(&scaled, transitions, &corrected);
        let z = fb.total_log_likelihood();
        if z.is_zero() {
            return discard(old_params, f64::NEG_INFINITY);
        }
        fit += z.to_log_value();
        fwbws.push(fb);
    }

    // first pass: normal equations for (shift, scale, drift) and scale_sd
    let mut a = [[0.0f64; 3]; 3];
    let mut b = [0.0f64; 3];
    let mut sd_num = 0.0;
    let mut sd_den = 0.0;
    for (si, fb) in fwbws.iter().enumerate() {
        let model = models[si];
        let events = event_seqs[si];
        for t in 0..fb.n_events() {
            let gamma = fb.posterior(t);
            let ev = &events[t];
            for j in 0..model.n_states() {
                let g = gamma[j].to_value();
                if g < MIN_WEIGHT {
                    continue;
                }
                let e = model.entry(j);
                let w = g / (e.level_stdv * e.level_stdv);
                let x = [1.0, e.level_mean, ev.start];
                for r in 0..3 {
                    for c in r..3 {
                        a[r][c] += w * x[r] * x[c];
                    }
                    b[r] += w * x[r] * ev.mean;
                }
                if e.sd_stdv > 0.0 {
                    let w2 = g / (e.sd_stdv * e.sd_stdv);
                    sd_num += w2 * ev.stdv * e.sd_mean;
                    sd_den += w2 * e.sd_mean * e.sd_mean;
                }
            }
        }
    }
    a[1][0] = a[0][1];
    a[2][0] = a[0][2];
    a[2][1] = a[1][2];

    let [shift, scale, drift] = match solve3(&a, &b) {
        Some(x) => x,
        None => return discard(old_params, fit),
    };
    let scale_sd = sd_num / sd_den;
    if !scale_sd.is_finite() {
        return discard(old_params, fit);
    }

    // second pass: observed/expected residual ratios for var and var_sd
    let mut var_num = 0.0;
    let mut var_den = 0.0;
    let mut var_sd_num = 0.0;
    let mut var_sd_den = 0.0;
    for (si, fb) in fwbws.iter().enumerate() {
        let model = models[si];
        let events = event_seqs[si];
        for t in 0..fb.n_events() {
            let gamma = fb.posterior(t);
            let ev = &events[t];
            for j in 0..model.n_states() {
                let g = gamma[j].to_value();
                if g < MIN_WEIGHT {
                    continue;
                }
                let e = model.entry(j);
                let resid = ev.mean - (scale * e.level_mean + shift + drift * ev.start);
                var_num += g * resid * resid / (e.level_stdv * e.level_stdv);
                var_den += g;
                if e.sd_stdv > 0.0 {
                    let resid_sd = ev.stdv - scale_sd * e.sd_mean;
                    var_sd_num += g * resid_sd * resid_sd / (e.sd_stdv * e.sd_stdv);
                    var_sd_den += g;
                }
            }
        }
    }
    let var = (var_num / var_den).sqrt();
    let var_sd = (var_sd_num / var_sd_den).sqrt();

    let params = ModelParams {
        shift,
        scale,
        drift,
        var,
        scale_sd,
        var_sd,
    };
    if !params.is_finite() || !(var > 0.0) || !(var_sd >= 0.0) {
        return discard(old_params, fit);
    }
    TrainOutcome {
        params,
        fit,
        done: false,
    }
}

///
/// Run rounds 1.. until convergence, starting from round 0's output
/// (`params0`, `fit0`). Stops on singularity, on a fit regression (reverting
/// to the pre-round parameters), on the hard round cap, and on insufficient
/// fit progress once more than one round has run. Returns the final
/// parameters, their last measured fit, and the round counter.
///
pub fn converge(
    event_seqs: &[&EventSequence],
    models: &[&PoreModel],
    transitions: &Transitions,
    params0: ModelParams,
    fit0: f64,
    max_rounds: u32,
    min_fit_progress: f64,
    ctx: &str,
) -> (ModelParams, f64, u32) {
    let mut round = 1u32;
    let mut crt_params = params0;
    let mut crt_fit = fit0;
    loop {
        let old_params = crt_params;
        let old_fit = crt_fit;
        let out = train_one_round(event_seqs, models, transitions, &old_params);
        crt_params = out.params;
        crt_fit = out.fit;
        debug!(
            "scaling_round {} old_params [{}] old_fit [{}] crt_params [{}] crt_fit [{}] round [{}]",
            ctx, old_params, old_fit, crt_params, crt_fit, round
        );
        if out.done {
            // singularity detected; stop
            break;
        }
        if crt_fit < old_fit {
            info!(
                "scaling_regression {} old_params [{}] old_fit [{}] crt_params [{}] crt_fit [{}] round [{}]",
                ctx, old_params, old_fit, crt_params, crt_fit, round
            );
            crt_params = old_params;
            crt_fit = old_fit;
            break;
        }
        round += 1;
        if round >= max_rounds || (round > 1 && crt_fit < old_fit + min_fit_progress) {
            break;
        }
    }
    info!(
        "scaling_result {} parameters [{}] fit [{}] rounds [{}]",
        ctx, crt_params, crt_fit, round
    );
    (crt_params, crt_fit, round)
}

//
// tests
//
