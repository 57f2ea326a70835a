//!
//! Command-line front end: option parsing, model/transition/input setup,
//! and the run driver.
//!

use crate::error::{Error, Result};
use crate::io::open_text;
use crate::model::{builtin_models, ModelDict, PoreModel, Strand};
use crate::pipeline::{basecall_reads, rescale_reads, PipelineOpts};
use crate::reads::{is_valid_event_file, ReadSummary};
use crate::transitions::Transitions;
use clap::Parser;
use log::{info, warn};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

///
/// Call bases in nanopore reads.
///
#[derive(Parser, Debug)]
#[command(name = "porecall", version, about = "Call bases in nanopore reads")]
pub struct Opts {
    /// Write per-read stats to this file.
    #[arg(long, value_name = "FILE")]
    pub stats: Option<PathBuf>,
    /// Minimum events per strand to consider.
    #[arg(long = "min-read-len", default_value_t = 1000, value_name = "INT")]
    pub min_read_len: usize,
    /// Maximum sequence line width.
    #[arg(long = "fasta-line-width", default_value_t = 80, value_name = "INT")]
    pub fasta_line_width: usize,
    /// Use a single round of forward/backward to select the best model per strand.
    #[arg(long = "scale-select-model-single-round")]
    pub scale_select_model_single_round: bool,
    /// Use the same scaling parameters for both strands.
    #[arg(long = "scale-strands-together")]
    pub scale_strands_together: bool,
    /// Minimum scaling fit progress.
    #[arg(long = "scale-min-fit-progress", default_value_t = 1.0, value_name = "FLOAT")]
    pub scale_min_fit_progress: f64,
    /// Maximum scaling rounds.
    #[arg(long = "scale-max-rounds", default_value_t = 10, value_name = "INT")]
    pub scale_max_rounds: u32,
    /// Number of events used for model scaling.
    #[arg(long = "scale-num-events", default_value_t = 200, value_name = "INT")]
    pub scale_num_events: usize,
    /// Stop after computing model scalings.
    #[arg(long = "scale-only")]
    pub scale_only: bool,
    /// Compute model scalings more accurately.
    #[arg(long)]
    pub accurate: bool,
    /// Minimum transition probability; smaller values are dropped.
    #[arg(long = "pr-cutoff", default_value_t = 0.001, value_name = "FLOAT")]
    pub pr_cutoff: f64,
    /// Probability of skipping at least one state.
    #[arg(long = "pr-skip", default_value_t = 0.1, value_name = "FLOAT")]
    pub pr_skip: f64,
    /// Probability of staying in the same state.
    #[arg(long = "pr-stay", default_value_t = 0.1, value_name = "FLOAT")]
    pub pr_stay: f64,
    /// Custom initial state transitions.
    #[arg(short = 's', long = "trans", value_name = "FILE")]
    pub trans: Option<PathBuf>,
    /// File of pore models, one `<strand>:<path>` per line.
    #[arg(long = "model-fofn", value_name = "FILE")]
    pub model_fofn: Option<PathBuf>,
    /// Custom pore model, `<strand>:<path>` with strand 0, 1, or 2.
    #[arg(short = 'm', long = "model", value_name = "STRAND:FILE")]
    pub model: Vec<String>,
    /// Output file; stdout if absent.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,
    /// Number of parallel threads.
    #[arg(short = 't', long = "threads", default_value_t = 1, value_name = "INT")]
    pub threads: usize,
    /// Input directories, event files, or files of event-file names
    /// (`-` reads such a list from stdin).
    #[arg(required = true, value_name = "PATH")]
    pub inputs: Vec<String>,
}

///
/// Parse a `<strand>:<path>` model argument.
///
pub fn parse_model_spec(s: &str) -> Result<(Strand, PathBuf)> {
    let bad = || {
        Error::config(format!(
            "could not parse model name \"{}\"; format should be \"[0|1|2]:<file>\"",
            s
        ))
    };
    let (strand, path) = s.split_once(':').ok_or_else(bad)?;
    let strand: Strand = match strand {
        "0" => 0,
        "1" => 1,
        "2" => 2,
        _ => return Err(bad()),
    };
    if path.is_empty() {
        return Err(bad());
    }
    Ok((strand, PathBuf::from(path)))
}

///
/// Load the model set: `--model`/`--model-fofn` arguments, or the built-in
/// tables when none are given. Models for exactly one of the two strands
/// (with none covering both) is a configuration error.
///
pub fn init_models(opts: &Opts) -> Result<ModelDict> {
    let mut specs: Vec<(Strand, PathBuf)> = Vec::new();
    for s in &opts.model {
        specs.push(parse_model_spec(s)?);
    }
    if let Some(fofn) = &opts.model_fofn {
        let reader = open_text(fofn)?;
        for line in reader.lines() {
            let line = line.map_err(|e| Error::io(&fofn.display().to_string(), e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            specs.push(parse_model_spec(line)?);
        }
    }
    if specs.is_empty() {
        return builtin_models();
    }
    let have = |st: Strand| specs.iter().any(|&(s, _)| s == st);
    if !have(2) && (have(0) != have(1)) {
        return Err(Error::config(format!(
            "models were specified only for strand {}; give models for both strands, or for neither",
            if have(0) { 0 } else { 1 }
        )));
    }
    let mut models = ModelDict::default();
    for (strand, path) in specs {
        let mut pm = PoreModel::from_file(&path)?;
        pm.set_strand(strand);
        let name = path.display().to_string();
        info!("loaded model [{}] for strand [{}]", name, strand);
        models.insert(name, pm);
    }
    let k = models.values().next().map(|m| m.k()).unwrap_or(0);
    if models.values().any(|m| m.k() != k) {
        return Err(Error::config("models must all use the same k"));
    }
    Ok(models)
}

///
/// The transition matrix: loaded from `--trans` when given, otherwise
/// computed from the `pr-*` parameters over the models' state space.
///
pub fn init_transitions(opts: &Opts, models: &ModelDict) -> Result<Transitions> {
    let space = models
        .values()
        .next()
        .map(|m| m.space())
        .ok_or_else(|| Error::config("no models loaded"))?;
    if let Some(path) = &opts.trans {
        let transitions = Transitions::from_file(path)?;
        if transitions.space() != space {
            return Err(Error::config(format!(
                "transition table is over k={} but models use k={}",
                transitions.space().k(),
                space.k()
            )));
        }
        return Ok(transitions);
    }
    if !(opts.pr_skip >= 0.0 && opts.pr_stay >= 0.0 && opts.pr_skip + opts.pr_stay < 1.0) {
        return Err(Error::config(format!(
            "invalid transition parameters pr-skip={} pr-stay={}",
            opts.pr_skip, opts.pr_stay
        )));
    }
    info!(
        "initialized state transitions with parameters p_skip=[{}], p_stay=[{}], p_cutoff=[{}]",
        opts.pr_skip, opts.pr_stay, opts.pr_cutoff
    );
    Ok(Transitions::compute(
        space,
        opts.pr_skip,
        opts.pr_stay,
        opts.pr_cutoff,
    ))
}

fn add_if_valid(files: &mut Vec<PathBuf>, path: PathBuf) {
    if is_valid_event_file(&path) {
        info!("adding input file [{}]", path.display());
        files.push(path);
    } else {
        info!("ignoring file [{}]", path.display());
    }
}

fn add_fofn(files: &mut Vec<PathBuf>, reader: impl BufRead, name: &str) -> Result<()> {
    for line in reader.lines() {
        let line = line.map_err(|e| Error::io(name, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        add_if_valid(files, PathBuf::from(line));
    }
    Ok(())
}

///
/// Resolve the positional inputs into a list of event-container files:
/// directories are scanned (subdirectories ignored), valid event files are
/// taken as-is, anything else is interpreted as a file of file names.
///
pub fn init_files(opts: &Opts) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in &opts.inputs {
        if input == "-" {
            info!("reading file names from stdin");
            let stdin = std::io::stdin();
            add_fofn(&mut files, stdin.lock(), "<stdin>")?;
            continue;
        }
        let path = Path::new(input);
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|e| Error::io(input, e))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .collect();
            entries.sort();
            for entry in entries {
                if entry.is_dir() {
                    info!("ignoring subdirectory [{}]", entry.display());
                } else {
                    add_if_valid(&mut files, entry);
                }
            }
        } else if is_valid_event_file(path) {
            info!("adding input file [{}]", path.display());
            files.push(path.to_path_buf());
        } else {
            info!("interpreting [{}] as fofn", input);
            let reader = open_text(path)?;
            add_fofn(&mut files, reader, input)?;
        }
    }
    if files.is_empty() {
        return Err(Error::config("no event files to process"));
    }
    Ok(files)
}

///
/// Build summaries and keep the reads worth processing: events present and
/// at least one strand at or above the minimum length.
///
pub fn init_reads(models: &ModelDict, files: &[PathBuf], opts: &Opts) -> Vec<ReadSummary> {
    let mut reads = Vec::new();
    for file in files {
        match ReadSummary::new(file, models, opts.scale_strands_together) {
            Ok(summary) => {
                info!("summary: {}", summary);
                let [s0, e0, s1, e1] = summary.strand_bounds;
                if summary.have_events
                    && (e0 >= s0 + opts.min_read_len || e1 >= s1 + opts.min_read_len)
                {
                    reads.push(summary);
                }
            }
            Err(e) => warn!("skipping [{}]: {}", file.display(), e),
        }
    }
    reads
}

fn pipeline_opts(opts: &Opts) -> PipelineOpts {
    PipelineOpts {
        min_read_len: opts.min_read_len,
        fasta_line_width: opts.fasta_line_width,
        scale_num_events: opts.scale_num_events,
        scale_max_rounds: opts.scale_max_rounds,
        scale_min_fit_progress: opts.scale_min_fit_progress,
        scale_strands_together: opts.scale_strands_together,
        scale_select_model_single_round: opts.scale_select_model_single_round,
        threads: opts.threads,
        ..PipelineOpts::default()
    }
}

///
/// The whole run: load models and transitions, discover inputs, summarize
/// reads, rescale if requested, basecall unless scaling-only, write stats.
///
pub fn run(opts: &Opts) -> Result<()> {
    let models = init_models(opts)?;
    let transitions = init_transitions(opts, &models)?;
    let files = init_files(opts)?;
    let mut reads = init_reads(&models, &files, opts);
    if reads.is_empty() {
        return Err(Error::NoReads);
    }
    let popts = pipeline_opts(opts);

    if opts.accurate || opts.scale_strands_together || opts.scale_select_model_single_round {
        rescale_reads(&models, &transitions, &mut reads, &popts);
    }
    if !opts.scale_only {
        let mut out: Box<dyn Write + Send> = match &opts.output {
            Some(path) => Box::new(
                std::fs::File::create(path)
                    .map_err(|e| Error::io(&path.display().to_string(), e))?,
            ),
            None => Box::new(std::io::stdout()),
        };
        basecall_reads(&models, &transitions, &mut reads, &popts, &mut out);
        out.flush().map_err(|e| Error::io("<output>", e))?;
    }
    if let Some(path) = &opts.stats {
        let mut w = std::fs::File::create(path)
            .map_err(|e| Error::io(&path.display().to_string(), e))?;
        for read in &reads {
            read.write_tsv(&mut w)
                .map_err(|e| Error::io(&path.display().to_string(), e))?;
        }
    }
    Ok(())
}

//
// tests
//
