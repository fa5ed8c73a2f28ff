//! Load-driven pool sizing
//!
//! The scaler keeps a rolling window of load samples (active / size) and,
//! when consulted by the maintenance loop, decides whether the pool should
//! grow or shrink. Decisions are capped per cycle and separated by a
//! cool-down so the pool does not thrash.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::PoolConfig;

const SHORT_WINDOW: Duration = Duration::from_secs(60);
const LONG_WINDOW: Duration = Duration::from_secs(300);
const RETENTION: Duration = Duration::from_secs(3600);

/// Occupancy figures the scaler decides on
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalingInput {
    pub size: usize,
    pub active: usize,
    pub available: usize,
    pub pending: usize,
}

impl ScalingInput {
    pub fn load(&self) -> f64 {
        if self.size == 0 {
            if self.pending > 0 {
                1.0
            } else {
                0.0
            }
        } else {
            (self.active as f64 / self.size as f64).min(1.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Hold,
    ScaleUp(usize),
    ScaleDown(usize),
}

/// Rolling load figures
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub avg_1m: f64,
    pub avg_5m: f64,
    pub samples: usize,
    pub since_last_scaling: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub target_free: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cool_down: Duration,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    pub scale_down_margin: usize,
}

impl From<&PoolConfig> for ScalerConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            min_size: config.min_size,
            max_size: config.max_size,
            target_free: config.target_free_connections,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            cool_down: config.scaling_cool_down,
            scale_up_step: config.scale_up_step.max(1),
            scale_down_step: config.scale_down_step.max(1),
            scale_down_margin: config.scale_down_margin,
        }
    }
}

pub struct DynamicScaler {
    config: ScalerConfig,
    samples: VecDeque<(Instant, f64)>,
    last_scaling: Option<Instant>,
}

impl DynamicScaler {
    pub fn new(config: ScalerConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            last_scaling: None,
        }
    }

    pub fn record_sample(&mut self, load: f64) {
        let now = Instant::now();
        self.samples.push_back((now, load));
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > RETENTION {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn average_over(&self, window: Duration) -> Option<f64> {
        let now = Instant::now();
        let (sum, count) = self
            .samples
            .iter()
            .rev()
            .take_while(|(at, _)| now.duration_since(*at) <= window)
            .fold((0.0, 0usize), |(sum, count), (_, load)| (sum + load, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    /// Current load blended with the short and long rolling averages
    pub fn blended_load(&self, current: f64) -> f64 {
        match (self.average_over(SHORT_WINDOW), self.average_over(LONG_WINDOW)) {
            (Some(short), Some(long)) => 0.6 * current + 0.25 * short + 0.15 * long,
            _ => current,
        }
    }

    pub fn in_cool_down(&self) -> bool {
        self.last_scaling
            .map(|at| at.elapsed() < self.config.cool_down)
            .unwrap_or(false)
    }

    /// Note that a scaling event was carried out
    pub fn mark_scaled(&mut self) {
        self.last_scaling = Some(Instant::now());
    }

    pub fn stats(&self) -> LoadStats {
        LoadStats {
            avg_1m: self.average_over(SHORT_WINDOW).unwrap_or(0.0),
            avg_5m: self.average_over(LONG_WINDOW).unwrap_or(0.0),
            samples: self.samples.len(),
            since_last_scaling: self.last_scaling.map(|at| at.elapsed()),
        }
    }

    /// Decide the next scaling step without performing it
    pub fn evaluate(&self, input: ScalingInput) -> ScalingDecision {
        if self.in_cool_down() {
            return ScalingDecision::Hold;
        }

        let config = &self.config;
        let load = self.blended_load(input.load());

        let wants_up = load >= config.scale_up_threshold
            || input.pending > 0
            || input.available < config.target_free;
        let room = config.max_size.saturating_sub(input.size);

        if wants_up && room > 0 {
            let needed = config
                .target_free
                .saturating_sub(input.available)
                .max(input.pending)
                .max(1);
            let amount = needed.min(config.scale_up_step).min(room);
            debug!(load, amount, size = input.size, "Scaler wants to grow");
            return ScalingDecision::ScaleUp(amount);
        }

        let wants_down = load <= config.scale_down_threshold
            && input.available > config.target_free + config.scale_down_margin
            && input.size > config.min_size;

        if wants_down && !wants_up {
            let amount = (input.available - config.target_free)
                .min(input.size - config.min_size)
                .min(config.scale_down_step);
            debug!(load, amount, size = input.size, "Scaler wants to shrink");
            return ScalingDecision::ScaleDown(amount);
        }

        ScalingDecision::Hold
    }
}
