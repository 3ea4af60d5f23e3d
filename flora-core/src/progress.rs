//! Coarse progress reporting for a single generation.
//!
//! The adapter announces the start and the end of a request; generators that
//! drive their own sampling loop report each finished step in between. Every
//! update goes through [`ProgressTracker`], which throttles step updates to
//! roughly every 10% and keeps the reported percentage non-decreasing.

use serde::Serialize;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Completion in percent, within `[0, 100]`.
    pub percent: f64,
    pub message: String,
}

pub trait ProgressObserver {
    fn on_progress(&mut self, update: ProgressUpdate);
}

impl<F: FnMut(ProgressUpdate)> ProgressObserver for F {
    fn on_progress(&mut self, update: ProgressUpdate) {
        self(update)
    }
}

/// Observer that only writes updates to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_progress(&mut self, update: ProgressUpdate) {
        tracing::info!(percent = update.percent, "{}", update.message);
    }
}

/// Number of steps between two step updates.
pub fn cadence(steps: usize) -> usize {
    (steps / 10).max(1)
}

pub struct ProgressTracker<'a> {
    observer: &'a mut dyn ProgressObserver,
    steps: usize,
    cadence: usize,
    last: f64,
    finished: bool,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(steps: usize, observer: &'a mut dyn ProgressObserver) -> Self {
        Self {
            observer,
            steps,
            cadence: cadence(steps),
            last: 0.0,
            finished: false,
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn start(&mut self) {
        self.emit(0.0, "Starting image generation...".to_string());
    }

    /// Reports that `step` (1-based) of the denoising loop has finished.
    pub fn step(&mut self, step: usize) {
        if self.steps == 0 || step == 0 || step % self.cadence != 0 {
            return;
        }
        let percent = step as f64 / self.steps as f64 * 100.0;
        self.emit(
            percent,
            format!("Processing step {step} of {}...", self.steps),
        );
    }

    pub fn finish(&mut self) {
        self.emit(100.0, "Completed!".to_string());
        self.finished = true;
    }

    fn emit(&mut self, percent: f64, message: String) {
        if self.finished {
            return;
        }
        let percent = percent.clamp(self.last, 100.0);
        self.last = percent;
        self.observer.on_progress(ProgressUpdate { percent, message });
    }
}
