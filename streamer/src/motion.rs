use camwatch_common::config::DetectorConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::downscale::DownscaledRaster;
use crate::events::FrameMetrics;

/// Outcome of comparing one raster against the one before it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub changed_pixels: u32,
    pub total_pixels: u32,
    pub ratio: f32,
    pub motion_fired: bool,
}

impl Detection {
    fn baseline(total_pixels: u32) -> Self {
        Self {
            changed_pixels: 0,
            total_pixels,
            ratio: 0.0,
            motion_fired: false,
        }
    }

    pub fn metrics(&self) -> FrameMetrics {
        FrameMetrics {
            ratio: self.ratio,
            changed_pixels: self.changed_pixels,
            total_pixels: self.total_pixels,
        }
    }
}

/// Sliding-window frame differencer.
///
/// Each raster is compared with the one immediately before it, then
/// replaces it. A pixel counts as changed when any RGB channel moved by
/// more than `per_channel_threshold`; motion fires when the changed share
/// reaches `difference_threshold_ratio` and the cooldown since the last
/// firing has passed.
pub struct MotionDetector {
    per_channel_threshold: u8,
    difference_threshold_ratio: f32,
    cooldown: Duration,
    previous: Option<DownscaledRaster>,
    last_fired: Option<Instant>,
}

impl MotionDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            per_channel_threshold: config.per_channel_threshold,
            difference_threshold_ratio: config.difference_threshold_ratio,
            cooldown: config.cooldown(),
            previous: None,
            last_fired: None,
        }
    }

    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }

    /// Forget the previous raster. The next frame becomes a fresh baseline.
    /// The cooldown clock is kept.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn evaluate(&mut self, current: DownscaledRaster, now: Instant) -> Detection {
        let total = current.pixel_count();
        let detection = match &self.previous {
            Some(previous) if previous.dimensions() == current.dimensions() => {
                let changed = count_changed(previous, &current, self.per_channel_threshold);
                let ratio = if total == 0 {
                    0.0
                } else {
                    changed as f32 / total as f32
                };
                let cooled_down = self
                    .last_fired
                    .map_or(true, |last| now.saturating_duration_since(last) > self.cooldown);
                let motion_fired =
                    changed > 0 && ratio >= self.difference_threshold_ratio && cooled_down;
                if motion_fired {
                    self.last_fired = Some(now);
                }
                Detection {
                    changed_pixels: changed,
                    total_pixels: total,
                    ratio,
                    motion_fired,
                }
            }
            Some(previous) => {
                debug!(
                    previous = ?previous.dimensions(),
                    current = ?current.dimensions(),
                    "raster size changed, starting a new baseline"
                );
                Detection::baseline(total)
            }
            None => Detection::baseline(total),
        };

        self.previous = Some(current);
        detection
    }
}

fn count_changed(previous: &DownscaledRaster, current: &DownscaledRaster, threshold: u8) -> u32 {
    previous
        .pixels()
        .zip(current.pixels())
        .filter(|(p, c)| p.0.iter().zip(c.0.iter()).any(|(a, b)| a.abs_diff(*b) > threshold))
        .count() as u32
}
