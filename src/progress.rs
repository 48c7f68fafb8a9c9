//! Progress reporting of flash writes.
use indicatif::{ProgressBar, ProgressStyle};

/// Receives `(current, step, total)` after every written block, where
/// `current` is the offset of the block just written. A final call reports
/// `current == total`.
pub trait ProgressSink {
    fn progress(&mut self, current: usize, step: usize, total: usize);
}

impl<F> ProgressSink for F
where
    F: FnMut(usize, usize, usize),
{
    fn progress(&mut self, current: usize, step: usize, total: usize) {
        self(current, step, total)
    }
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&mut self, _current: usize, _step: usize, _total: usize) {}
}

/// Terminal progress bar, created on the first report.
#[derive(Debug, Default)]
pub struct BarProgress {
    bar: Option<ProgressBar>,
}

impl BarProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn bar(&mut self, total: usize) -> &ProgressBar {
        self.bar.get_or_insert_with(|| {
            let style = ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            let bar = ProgressBar::new(total as u64);
            bar.set_style(style);
            bar.set_message("Writing flash");
            bar
        })
    }
}

impl ProgressSink for BarProgress {
    fn progress(&mut self, current: usize, _step: usize, total: usize) {
        let bar = self.bar(total);
        bar.set_position(current as u64);
        if current == total {
            bar.finish();
        }
    }
}
