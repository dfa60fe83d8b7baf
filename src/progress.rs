//! Progress bar wrapper around indicatif for downloads, hash checks and builds
use crate::format::format_bytes_per_sec;
use indicatif::{ProgressBar as IndicatifProgressBar, ProgressDrawTarget, ProgressStyle};

/// Progress reporting for one long-running operation.
///
/// A disabled bar is hidden but still counts, so callers never branch on it.
pub struct ProgressBar {
    pb: IndicatifProgressBar,
    show_bytes: bool,
}

impl ProgressBar {
    /// Item counter (records, bundles)
    pub fn items(total: Option<u64>, label: &str, enabled: bool) -> Self {
        let pb = new_bar(total, enabled);
        let template = if total.is_some() {
            "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | ETA: {eta}"
        } else {
            "{spinner:.green} {prefix} [{elapsed_precise}] {pos} records"
        };
        apply_style(&pb, template);
        pb.set_prefix(label.to_string());
        Self {
            pb,
            show_bytes: false,
        }
    }

    /// Byte counter with transfer rate
    pub fn bytes(total: Option<u64>, label: &str, enabled: bool) -> Self {
        let pb = new_bar(total, enabled);
        let template = if total.is_some() {
            "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg} | ETA: {eta}"
        } else {
            "{spinner:.green} {prefix} [{elapsed_precise}] {bytes} | {msg}"
        };
        apply_style(&pb, template);
        pb.set_prefix(label.to_string());
        Self {
            pb,
            show_bytes: true,
        }
    }

    /// A bar that never draws
    pub fn hidden() -> Self {
        Self {
            pb: IndicatifProgressBar::hidden(),
            show_bytes: false,
        }
    }

    pub fn inc(&self, delta: u64) {
        self.pb.inc(delta);
        if self.show_bytes {
            let elapsed = self.pb.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.pb
                    .set_message(format_bytes_per_sec(self.pb.position() as f64 / elapsed));
            }
        }
    }

    pub fn set_length(&self, total: u64) {
        self.pb.set_length(total);
    }

    pub fn position(&self) -> u64 {
        self.pb.position()
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

fn new_bar(total: Option<u64>, enabled: bool) -> IndicatifProgressBar {
    let pb = match total {
        Some(total) => IndicatifProgressBar::new(total),
        None => IndicatifProgressBar::new_spinner(),
    };
    if !enabled {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb
}

fn apply_style(pb: &IndicatifProgressBar, template: &str) {
    match ProgressStyle::default_bar().template(template) {
        Ok(style) => pb.set_style(style.progress_chars("█▓▒░ ")),
        Err(e) => log::debug!("Invalid progress template: {}", e),
    }
}
