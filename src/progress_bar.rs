//! Progress display and cooperative cancellation for the sampler loops.
//!
//! * `SamplerProgress` – an `indicatif` bar when the `progress` feature is enabled, a no-op
//!   otherwise, so the sampler loops are written once. It also keeps a smoothed iteration
//!   time, `mean ← 0.2·step + 0.8·mean`, seeded by the first iteration.
//! * `StepTime` – an iteration duration shown as `"253µs"`, `"42ms"` or `"3.14s"`.
//! * `CancelPoll` – calls the user `should_cancel()` closure on a wall-clock interval
//!   (not on iteration counts), keeping the cancellation latency stable whatever the cost of
//!   one likelihood evaluation.
use std::fmt;
use std::time::{Duration, Instant};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

/// Minimal interval between two calls to `should_cancel()`.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Weight of the latest iteration in the smoothed iteration time.
const SMOOTHING: f64 = 0.2;

/// Duration of one sampler iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct StepTime(pub(crate) Duration);

impl fmt::Display for StepTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_micros() {
            us if us < 1_000 => write!(f, "{us}µs"),
            us if us < 1_000_000 => write!(f, "{}ms", us / 1_000),
            _ => write!(f, "{:.2}s", self.0.as_secs_f64()),
        }
    }
}

#[cfg(feature = "progress")]
fn stage_bar(total: u64, stage: &str) -> ProgressBar {
    let pb = ProgressBar::new(total.max(1));
    let style = ProgressStyle::with_template(
        "{prefix:>10} {bar:40.cyan/blue} {pos}/{len} ({percent:>3}%) | {per_sec} | ETA {eta_precise} | {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(stage.to_string());
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// Progress display of one sampling stage.
pub(crate) struct SamplerProgress {
    #[cfg(feature = "progress")]
    pb: ProgressBar,
    last_tick: Instant,
    mean: Option<Duration>,
}

impl SamplerProgress {
    pub(crate) fn new(total: u64, stage: &str) -> Self {
        #[cfg(not(feature = "progress"))]
        let _ = (total, stage);
        SamplerProgress {
            #[cfg(feature = "progress")]
            pb: stage_bar(total, stage),
            last_tick: Instant::now(),
            mean: None,
        }
    }

    /// Mark the end of one iteration and return its duration.
    pub(crate) fn tick(&mut self) -> StepTime {
        let now = Instant::now();
        let step = now.duration_since(self.last_tick);
        self.last_tick = now;
        self.mean = Some(match self.mean {
            None => step,
            Some(mean) => step.mul_f64(SMOOTHING) + mean.mul_f64(1.0 - SMOOTHING),
        });
        #[cfg(feature = "progress")]
        {
            self.pb
                .set_message(format!("last: {}, avg: {}", StepTime(step), self.avg()));
            self.pb.inc(1);
        }
        StepTime(step)
    }

    /// Smoothed iteration time, zero before the first tick.
    pub(crate) fn avg(&self) -> StepTime {
        StepTime(self.mean.unwrap_or_default())
    }

    pub(crate) fn interrupted(self) {
        #[cfg(feature = "progress")]
        {
            self.pb.set_message("Interrupted");
            self.pb.disable_steady_tick();
            self.pb.finish_and_clear();
        }
    }

    pub(crate) fn finish(self) {
        #[cfg(feature = "progress")]
        {
            self.pb.disable_steady_tick();
            self.pb.finish_and_clear();
        }
    }
}

/// Wall-clock throttled cancellation check.
pub(crate) struct CancelPoll {
    last_poll: Instant,
}

impl CancelPoll {
    pub(crate) fn new() -> Self {
        CancelPoll {
            last_poll: Instant::now(),
        }
    }

    /// `true` once `should_cancel()` answered yes. The closure is called at most once per
    /// [`POLL_INTERVAL`].
    pub(crate) fn cancelled<F: FnMut() -> bool>(&mut self, should_cancel: &mut F) -> bool {
        if self.last_poll.elapsed() < POLL_INTERVAL {
            return false;
        }
        self.last_poll = Instant::now();
        should_cancel()
    }
}
