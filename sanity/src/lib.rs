//! Call storms: random trees of intercepted calls, run through real
//! thunks and checked against what the pool must have done.
//!
//! Every node of a tree is a [`probe::callback`] frame, so every node's
//! return goes through a thunk. Nodes record their depth right before
//! returning; since a thunk's slot index is the depth it was handed out
//! at, the delegate must see exactly that sequence of slots.

pub use anyhow::{ensure, Result};
use ahash::AHasher;
use indexmap::IndexMap;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rethook::binding::with_bound;
use rethook::{probe, ExitRecorder, RetAddr, ReturnThunkFactory, THUNKS_PER_PAGE};
use std::cell::RefCell;
use std::hash::BuildHasherDefault;

type SlotBook = IndexMap<RetAddr, usize, BuildHasherDefault<AHasher>>;

/// Marks the argument of a node on the round's spine.
const SPINE: u64 = 1 << 63;

#[derive(Clone, Copy, Debug)]
pub struct StormConfig {
    pub rounds:             usize,
    /// No node goes deeper than this.
    pub max_depth:          u64,
    /// Most extra children a node may get.
    pub max_fanout:         u32,
    /// Rough size of each round's tree.
    pub calls_per_round:    usize,
    pub seed:               u64,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            rounds:             50,
            max_depth:          (2 * THUNKS_PER_PAGE + 20) as u64,
            max_fanout:         3,
            calls_per_round:    1000,
            seed:               0x5eed,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StormReport {
    pub calls:          usize,
    /// Deepest slot index seen.
    pub deepest:        usize,
    /// How many different thunks were ever handed out.
    pub distinct:       usize,
    pub pages:          usize,
    /// Sum over rounds of last minus first raw sample.
    pub raw_span:       u64,
}

/// Per-thread state of the storm being run. Only touched between
/// interceptions, never across one.
struct Storm {
    rng:            StdRng,
    max_depth:      u64,
    max_fanout:     u32,
    // Each round forces one chain this deep, so pages get crossed.
    spine:          u64,
    budget:         usize,
    exits:          Vec<usize>,
}

impl Storm {
    fn new(cfg: &StormConfig, seed: u64) -> Self {
        Self {
            rng:        StdRng::seed_from_u64(seed),
            max_depth:  cfg.max_depth,
            max_fanout: cfg.max_fanout,
            spine:      0,
            budget:     0,
            exits:      vec![],
        }
    }

    fn begin_round(&mut self, calls: usize) {
        self.spine = self.rng.gen_range(0..=self.max_depth);
        self.budget = calls;
        self.exits.clear();
    }

    /// Decides the children of a node: whether the spine goes on below
    /// it, and how many other children it gets.
    fn children(&mut self, depth: u64, on_spine: bool) -> (bool, u32) {
        let spine_child = on_spine && depth < self.spine;
        if depth >= self.max_depth || self.budget == 0 {
            return (spine_child, 0);
        }
        let extra = self.rng.gen_range(0..=self.max_fanout).min(self.budget as u32);
        self.budget -= extra as usize;

        (spine_child, extra)
    }
}

thread_local! {
    static STORM: RefCell<Option<Storm>> = const { RefCell::new(None) };
}

/// One node. Returns the size of its subtree.
extern "C" fn visit(arg: u64) -> u64 {
    let depth = arg & !SPINE;
    let (spine_child, extra) = STORM.with(|cell| match cell.borrow_mut().as_mut() {
        Some(storm) => { storm.children(depth, arg & SPINE != 0) },
        None        => { (false, 0) }
    });

    let mut calls = 1;
    if spine_child {
        calls += probe::callback(visit, (depth + 1) | SPINE);
    }
    for _ in 0..extra {
        calls += probe::callback(visit, depth + 1);
    }

    STORM.with(|cell| {
        if let Some(storm) = cell.borrow_mut().as_mut() {
            storm.exits.push(depth as usize);
        }
    });

    calls
}

/// Runs `cfg.rounds` trees on the current thread, with a factory of its
/// own, and checks every one of them.
pub fn run_storm(cfg: &StormConfig, seed: u64) -> Result<StormReport> {
    let recorder = ExitRecorder::with_capacity(cfg.calls_per_round + cfg.max_depth as usize + 1);
    let factory = ReturnThunkFactory::new(&recorder)?;
    let mut slots = SlotBook::default();
    let mut report = StormReport::default();

    STORM.with(|cell| *cell.borrow_mut() = Some(Storm::new(cfg, seed)));
    let outcome = (|| -> Result<()> {
        for round in 0..cfg.rounds {
            STORM.with(|cell| {
                if let Some(storm) = cell.borrow_mut().as_mut() {
                    storm.begin_round(cfg.calls_per_round);
                }
            });
            let calls = with_bound(&factory, || probe::callback(visit, SPINE))? as usize;
            let events = recorder.take();
            let expected = STORM.with(|cell| {
                cell.borrow_mut().as_mut().map(|storm| std::mem::take(&mut storm.exits))
            }).unwrap_or_default();

            ensure!(events.len() == calls, "round {}: {} calls but {} exits", round, calls, events.len());
            ensure!(expected.len() == calls, "round {}: {} calls but {} nodes", round, calls, expected.len());
            ensure!(factory.depth() == 0, "round {}: {} thunks still live", round, factory.depth());
            for (i, (event, depth)) in events.iter().zip(&expected).enumerate() {
                ensure!(
                    event.slot == *depth,
                    "round {}: exit #{} came from slot {}, expected {}", round, i, event.slot, depth
                );
                *slots.entry(event.thunk).or_insert(0) += 1;
                report.deepest = report.deepest.max(event.slot);
            }
            if let (Some(first), Some(last)) = (events.first(), events.last()) {
                report.raw_span = report.raw_span.wrapping_add(last.raw.wrapping_sub(first.raw));
            }
            report.calls += calls;
            debug!("round {}: {} calls, {} thunk pages", round, calls, factory.page_count());
        }

        Ok(())
    })();
    STORM.with(|cell| *cell.borrow_mut() = None);
    outcome?;

    // One thunk per depth, reused every time that depth comes back.
    report.distinct = slots.len();
    report.pages = factory.page_count();
    ensure!(
        report.calls == 0 || report.distinct == report.deepest + 1,
        "{} distinct thunks for {} depths", report.distinct, report.deepest + 1
    );
    ensure!(
        report.pages == (report.deepest / THUNKS_PER_PAGE + 1),
        "{} pages mapped for depth {}", report.pages, report.deepest
    );

    Ok(report)
}

/// Runs one storm per thread, in parallel. Thread `i` seeds its storm
/// with `cfg.seed + i`.
pub fn run_storms(cfg: &StormConfig, threads: usize) -> Result<Vec<StormReport>> {
    (0..threads)
        .into_par_iter()
        .map(|t| run_storm(cfg, cfg.seed.wrapping_add(t as u64)))
        .collect()
}
