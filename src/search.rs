use crate::{Error, TrialRunner};
use serde::Serialize;
use tracing::info;

/// Relative gain below which another doubling is not worth it.
///
/// A new throughput below 1.02x the previous one (< 2% improvement) ends the
/// expansion phase.
const MIN_GAIN: f64 = 1.02;

/// A single trial outcome: the VU count probed and the throughput it
/// sustained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Observation {
    /// Number of concurrent virtual users during the trial.
    pub vus: usize,
    /// Measured throughput, in requests per second.
    pub throughput: f64,
}

/// The phase a [`PlateauSearcher`] is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    /// Doubling the VU count while throughput keeps improving.
    Expanding,
    /// Bisecting between the last two expansion points.
    Refining,
    /// No more candidates.
    Done,
}

/// An iterator that finds the VU count at which throughput plateaus.
///
/// The search has two phases. First, the VU count is doubled from the start
/// value until either the next doubling would exceed the maximum, or the
/// newest throughput improves on the immediately preceding one by less than
/// 2%. Then the range between the last two expansion points is bisected: a
/// probe that beats the best throughput seen so far moves the lower bound
/// above it, any other probe moves the upper bound below it, until the
/// bounds meet.
///
/// The expansion rule compares raw consecutive throughputs, not a running
/// maximum, so a single noisy dip ends the phase early. That sensitivity is
/// deliberate: it keeps results comparable across runs of the same tool.
///
/// Call [`observe`](PlateauSearcher::observe) with the measured throughput
/// after each candidate yielded by [`Iterator::next`]. A candidate that is
/// never observed is treated as having sustained zero throughput.
///
/// # Examples
///
/// ```rust
/// use plateau::PlateauSearcher;
///
/// let mut search = PlateauSearcher::new(64);
/// // The starting VU count is the first candidate.
/// assert_eq!(search.next(), Some(1));
/// search.observe(10.0);
/// // Throughput nearly doubled, so the VU count doubles.
/// assert_eq!(search.next(), Some(2));
/// search.observe(19.0);
/// assert_eq!(search.next(), Some(4));
/// // Only a 1.05% gain: below the 2% threshold, so expansion ends and the
/// // search bisects between the last two points, 2 and 4.
/// search.observe(19.2);
/// assert_eq!(search.next(), Some(3));
/// // No improvement over the best seen (19.2), so the upper bound drops
/// // below 3 and the bounds meet.
/// search.observe(18.0);
/// assert_eq!(search.next(), None);
/// ```
#[derive(Debug, Clone)]
pub struct PlateauSearcher {
    max_vus: usize,
    pending: Option<usize>,
    observed: Option<f64>,
    prev: f64,
    history: Vec<Observation>,
    phase: Phase,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Expanding { next: usize },
    Refining { low: usize, high: usize, best: f64 },
    Done,
}

impl PlateauSearcher {
    /// Search for the throughput plateau between 1 and `max_vus` virtual
    /// users.
    pub fn new(max_vus: usize) -> Self {
        Self::starting_at(1, max_vus)
    }

    /// Search for the throughput plateau between `start_vus` and `max_vus`.
    ///
    /// `start_vus` is clamped to at least 1 and is always probed, even when
    /// it exceeds `max_vus`.
    pub fn starting_at(start_vus: usize, max_vus: usize) -> Self {
        let start = start_vus.max(1);
        Self {
            max_vus: max_vus.max(start),
            pending: None,
            observed: None,
            prev: 0.0,
            history: Vec::new(),
            phase: Phase::Expanding { next: start },
        }
    }

    /// Report the throughput measured for the candidate most recently
    /// yielded by [`Iterator::next`].
    ///
    /// Negative values are clamped to zero; throughput is never negative.
    pub fn observe(&mut self, throughput: f64) {
        self.observed = Some(throughput.max(0.0));
    }

    /// The phase the search is currently in.
    pub fn phase(&self) -> SearchPhase {
        match self.phase {
            Phase::Expanding { .. } => SearchPhase::Expanding,
            Phase::Refining { .. } => SearchPhase::Refining,
            Phase::Done => SearchPhase::Done,
        }
    }

    /// Every observation recorded so far, in probe order.
    pub fn history(&self) -> &[Observation] {
        &self.history
    }

    /// Consume the searcher, yielding the full observation history.
    pub fn into_history(self) -> Vec<Observation> {
        self.history
    }

    fn record(&mut self, vus: usize, throughput: f64) {
        self.history.push(Observation { vus, throughput });
        match self.phase {
            Phase::Expanding { .. } => {
                if throughput < self.prev * MIN_GAIN {
                    // less than a 2% improvement over the previous point
                    self.phase = self.refinement();
                } else {
                    self.prev = throughput;
                    let doubled = vus.saturating_mul(2);
                    if doubled > self.max_vus {
                        self.phase = self.refinement();
                    } else {
                        self.phase = Phase::Expanding { next: doubled };
                    }
                }
            }
            Phase::Refining { low, high, best } => {
                // `vus` is the midpoint probed last
                let (low, high, best) = if throughput > best {
                    // still rising, so the plateau lies above the midpoint
                    (vus + 1, high, throughput)
                } else {
                    (low, vus - 1, best)
                };
                self.phase = if low < high {
                    Phase::Refining { low, high, best }
                } else {
                    Phase::Done
                };
            }
            Phase::Done => {}
        }
    }

    /// The refinement phase between the last two recorded points, or
    /// [`Phase::Done`] when fewer than two points exist.
    fn refinement(&self) -> Phase {
        let n = self.history.len();
        if n < 2 {
            return Phase::Done;
        }
        let low = self.history[n - 2].vus;
        let high = self.history[n - 1].vus;
        if low >= high {
            return Phase::Done;
        }
        let best = self
            .history
            .iter()
            .fold(0.0_f64, |best, obs| best.max(obs.throughput));
        Phase::Refining { low, high, best }
    }
}

impl Iterator for PlateauSearcher {
    type Item = usize;
    fn next(&mut self) -> Option<Self::Item> {
        if let Some(vus) = self.pending.take() {
            let throughput = self.observed.take().unwrap_or(0.0);
            self.record(vus, throughput);
        }

        let candidate = match self.phase {
            Phase::Expanding { next } => next,
            Phase::Refining { low, high, .. } => low + (high - low) / 2,
            Phase::Done => return None,
        };
        self.pending = Some(candidate);
        Some(candidate)
    }
}

/// The result of a completed search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    /// The highest-throughput observation across the whole search. Ties go
    /// to the observation with fewer VUs, and the VU count is always one
    /// that was actually evaluated.
    pub optimal: Observation,
    /// Every observation, in probe order.
    pub history: Vec<Observation>,
}

/// Drive `runner` through a full plateau search and return the optimal VU
/// count along with the observation history.
///
/// Trials run strictly one at a time: each needs uncontended access to the
/// endpoint for its throughput to mean anything, so this call blocks for the
/// duration of every trial it schedules. Only configuration-class errors
/// from the runner abort the search; a runner that follows the
/// [`TrialRunner`] contract reports failed trials as zero throughput
/// instead.
///
/// # Examples
///
/// ```rust
/// // Any `FnMut(usize) -> Result<f64, Error>` is a runner; real searches
/// // use `K6Runner`. This endpoint saturates at 20 req/s.
/// let mut runner = |vus: usize| -> Result<f64, plateau::Error> {
///     Ok(f64::min(vus as f64, 20.0))
/// };
/// let outcome = plateau::find_optimal_vus(&mut runner, 64, 1)?;
/// assert_eq!(outcome.optimal.throughput, 20.0);
/// # Ok::<(), plateau::Error>(())
/// ```
pub fn find_optimal_vus<R>(
    runner: &mut R,
    max_vus: usize,
    start_vus: usize,
) -> Result<SearchOutcome, Error>
where
    R: TrialRunner + ?Sized,
{
    let mut search = PlateauSearcher::starting_at(start_vus, max_vus);
    info!(start_vus, max_vus, "starting search for optimal VUs");

    // The searcher always yields its starting VU count first.
    let first = search.next().unwrap_or(start_vus.max(1));
    info!(vus = first, phase = ?search.phase(), "running trial");
    let throughput = runner.run(first)?;
    info!(vus = first, throughput, "trial complete");
    search.observe(throughput);
    let mut optimal = Observation {
        vus: first,
        throughput,
    };

    while let Some(vus) = search.next() {
        info!(vus, phase = ?search.phase(), "running trial");
        let throughput = runner.run(vus)?;
        info!(vus, throughput, "trial complete");
        search.observe(throughput);
        if throughput > optimal.throughput
            || (throughput == optimal.throughput && vus < optimal.vus)
        {
            optimal = Observation { vus, throughput };
        }
    }

    info!(
        optimal_vus = optimal.vus,
        throughput = optimal.throughput,
        trials = search.history().len(),
        "search complete"
    );
    Ok(SearchOutcome {
        optimal,
        history: search.into_history(),
    })
}

#[cfg(test)]
fn drive(search: &mut PlateauSearcher, throughput: impl Fn(usize) -> f64) -> Vec<Observation> {
    while let Some(vus) = search.next() {
        search.observe(throughput(vus));
    }
    search.history().to_vec()
}

#[test]
fn expansion_stops_below_two_percent_gain() {
    // throughputs 10, 19, 19.2: the last step is a 1.05% gain
    let mut search = PlateauSearcher::starting_at(1, 64);
    assert_eq!(search.next(), Some(1));
    search.observe(10.0);
    assert_eq!(search.next(), Some(2));
    search.observe(19.0);
    assert_eq!(search.next(), Some(4));
    search.observe(19.2);

    // expansion ends after 4 VUs; refinement bisects 2..4
    assert_eq!(search.next(), Some(3));
    assert_eq!(search.phase(), SearchPhase::Refining);
}

#[test]
fn monotonic_growth_expands_to_the_cap() {
    // doubling throughput never trips the 2% rule, so expansion only stops
    // at the VU cap
    let mut search = PlateauSearcher::new(64);
    let history = drive(&mut search, |vus| vus as f64);
    let expansion: Vec<usize> = history.iter().map(|obs| obs.vus).collect();
    assert_eq!(&expansion[..7], &[1, 2, 4, 8, 16, 32, 64]);
    assert_eq!(search.phase(), SearchPhase::Done);
}

#[test]
fn single_point_skips_refinement() {
    // the very first observation undercuts nothing, but a start above the
    // cap leaves no second expansion point
    let mut search = PlateauSearcher::starting_at(100, 64);
    assert_eq!(search.next(), Some(100));
    search.observe(5.0);
    assert_eq!(search.next(), None);
    assert_eq!(search.history().len(), 1);
}

#[test]
fn refinement_terminates_within_log_probes() {
    // worst case for a 32..64 range is ~log2(32) bisections
    let mut search = PlateauSearcher::new(64);
    let history = drive(&mut search, |vus| vus as f64);
    assert!(history.len() <= 7 + 6, "took {} probes", history.len());
    assert_eq!(search.phase(), SearchPhase::Done);
}

#[test]
fn refinement_moves_up_on_improvement() {
    let mut search = PlateauSearcher::starting_at(1, 8);
    // expansion: 1, 2, 4, 8 all improving; 16 would exceed the cap
    for (vus, throughput) in [(1, 10.0), (2, 20.0), (4, 40.0), (8, 80.0)] {
        assert_eq!(search.next(), Some(vus));
        search.observe(throughput);
    }
    // refinement bisects 4..8
    assert_eq!(search.next(), Some(6));
    search.observe(90.0); // beats the best (80), so low moves to 7
    assert_eq!(search.next(), Some(7));
    search.observe(85.0); // does not beat 90, so high moves to 6
    assert_eq!(search.next(), None);
}

#[test]
fn unobserved_candidate_counts_as_zero() {
    let mut search = PlateauSearcher::new(64);
    assert_eq!(search.next(), Some(1));
    search.observe(10.0);
    assert_eq!(search.next(), Some(2));
    // no observation reported: treated as zero, which ends expansion
    assert_eq!(search.next(), Some(1)); // bisecting 1..2 probes 1
    assert_eq!(search.phase(), SearchPhase::Refining);
}

#[test]
fn negative_throughput_is_clamped() {
    let mut search = PlateauSearcher::new(64);
    assert_eq!(search.next(), Some(1));
    search.observe(-3.0);
    // clamped to 0.0, which does not undercut prev * 1.02 == 0.0
    assert_eq!(search.next(), Some(2));
}

#[test]
fn driver_returns_highest_observed_point() {
    let mut calls = Vec::new();
    let mut runner = |vus: usize| -> Result<f64, Error> {
        calls.push(vus);
        // saturates at 24 req/s
        Ok(f64::min(vus as f64, 24.0))
    };
    let outcome = find_optimal_vus(&mut runner, 64, 1).unwrap();

    assert_eq!(outcome.optimal, Observation { vus: 32, throughput: 24.0 });
    // expansion probed 1..=64; the plateau was detected at 64
    assert_eq!(&calls[..7], &[1, 2, 4, 8, 16, 32, 64]);
    assert_eq!(outcome.history.len(), calls.len());
    // every probe is positive and within the cap
    assert!(calls.iter().all(|&vus| vus >= 1 && vus <= 64));
}

#[test]
fn driver_propagates_fatal_errors() {
    let mut runner = |_vus: usize| -> Result<f64, Error> {
        Err(Error::UnknownTask("foo.js.j2".to_owned()))
    };
    assert!(matches!(
        find_optimal_vus(&mut runner, 64, 1),
        Err(Error::UnknownTask(_))
    ));
}
