//!
//! Bounded-queue parallel for with ordered output.
//!
//! A single-threaded producer closure dispenses work items; N workers each
//! fold a chunk of items into a fresh output accumulator; a collector
//! reorders finished chunks by their production index and hands them to the
//! single-threaded output callback, so output order always equals input
//! order regardless of worker scheduling. A worker panic unwinds through
//! the scope and aborts the run.
//!

use crossbeam_channel::bounded;
use std::collections::BTreeMap;
use std::time::Instant;

///
/// Drive `work` over every item `produce` yields.
///
/// * `produce` runs on the calling thread until it returns None.
/// * `work(item, &mut acc)` runs on one of `num_threads` workers; each chunk
///   of `chunk_size` consecutive items shares one accumulator.
/// * `output` receives the accumulators in production order, on a single
///   thread.
/// * `progress(items_done, seconds_elapsed)` fires at most once per
///   wall-clock second.
///
pub fn pfor<I, O, P, W, C, R>(
    num_threads: usize,
    chunk_size: usize,
    mut produce: P,
    work: W,
    mut output: C,
    mut progress: R,
) where
    I: Send,
    O: Default + Send,
    P: FnMut() -> Option<I>,
    W: Fn(I, &mut O) + Sync,
    C: FnMut(O) + Send,
    R: FnMut(u64, u64) + Send,
{
    let num_threads = num_threads.max(1);
    let chunk_size = chunk_size.max(1);
    let (work_tx, work_rx) = bounded::<(u64, Vec<I>)>(2 * num_threads);
    let (done_tx, done_rx) = bounded::<(u64, O, u64)>(2 * num_threads);
    let start = Instant::now();

    std::thread::scope(|scope| {
        for _ in 0..num_threads {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let work = &work;
            scope.spawn(move || {
                while let Ok((chunk_idx, items)) = work_rx.recv() {
                    let n_items = items.len() as u64;
                    let mut acc = O::default();
                    for item in items {
                        work(item, &mut acc);
                    }
                    if done_tx.send((chunk_idx, acc, n_items)).is_err() {
                        break;
                    }
                }
            });
        }
        // the scope owns the original endpoints through the clones above;
        // drop ours so the channels close when production ends
        drop(work_rx);
        drop(done_tx);

        scope.spawn(move || {
            let mut pending: BTreeMap<u64, (O, u64)> = BTreeMap::new();
            let mut next_chunk = 0u64;
            let mut items_done = 0u64;
            let mut last_report = Instant::now();
            while let Ok((chunk_idx, acc, n_items)) = done_rx.recv() {
                pending.insert(chunk_idx, (acc, n_items));
                while let Some((acc, n_items)) = pending.remove(&next_chunk) {
                    output(acc);
                    items_done += n_items;
                    next_chunk += 1;
                }
                if last_report.elapsed().as_secs() >= 1 {
                    progress(items_done, start.elapsed().as_secs());
                    last_report = Instant::now();
                }
            }
        });

        let mut chunk_idx = 0u64;
        let mut chunk = Vec::with_capacity(chunk_size);
        loop {
            match produce() {
                Some(item) => {
                    chunk.push(item);
                    if chunk.len() == chunk_size {
                        let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                        if work_tx.send((chunk_idx, full)).is_err() {
                            break;
                        }
                        chunk_idx += 1;
                    }
                }
                None => {
                    if !chunk.is_empty() {
                        let _ = work_tx.send((chunk_idx, chunk));
                    }
                    break;
                }
            }
        }
        drop(work_tx);
    });
}

//
// tests
//
