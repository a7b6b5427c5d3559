//! Метрики детекции: FPS и задержка инференса
//!
//! FPS считается по окнам в одну секунду. Каждый `SAMPLE_INTERVAL`-й кадр
//! сохраняется как образец; хранится не больше `MAX_SAMPLES` последних.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Сколько последних образцов хранится
pub const MAX_SAMPLES: usize = 500;

/// Образец берётся с каждого N-го кадра
pub const SAMPLE_INTERVAL: u32 = 5;

/// Окно подсчёта FPS
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    /// Unix время в миллисекундах
    pub timestamp: i64,
    pub latency_ms: f64,
    /// FPS последнего закрытого окна
    pub fps: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub current_fps: u32,
    pub median_latency: f64,
    pub p95_latency: f64,
    /// Сумма FPS по образцам
    pub total_frames: u64,
    pub samples_collected: usize,
}

#[derive(Debug)]
pub struct MetricsCollector {
    samples: VecDeque<MetricsSample>,
    window_frames: u32,
    window_start: Instant,
    frames_since_sample: u32,
    current_fps: u32,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Коллектор с началом первого окна FPS в `start`
    pub fn starting_at(start: Instant) -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            window_frames: 0,
            window_start: start,
            frames_since_sample: 0,
            current_fps: 0,
        }
    }

    /// Учитывает обработанный кадр с задержкой `latency`
    pub fn add_frame(&mut self, latency: Duration) {
        self.record_at(latency, Instant::now());
    }

    pub fn record_at(&mut self, latency: Duration, now: Instant) {
        self.window_frames += 1;
        self.frames_since_sample += 1;

        if now.saturating_duration_since(self.window_start) >= FPS_WINDOW {
            self.current_fps = self.window_frames;
            self.window_frames = 0;
            self.window_start = now;
        }

        if self.frames_since_sample < SAMPLE_INTERVAL {
            return;
        }
        self.frames_since_sample = 0;

        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(MetricsSample {
            timestamp: chrono::Utc::now().timestamp_millis(),
            latency_ms: latency.as_nanos() as f64 / 1_000_000.0,
            fps: self.current_fps,
        });
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        let latencies: Vec<f64> = self.samples.iter().map(|s| s.latency_ms).collect();
        PerformanceMetrics {
            current_fps: self.current_fps,
            median_latency: median(&latencies),
            p95_latency: percentile(&latencies, 95.0),
            total_frames: self.samples.iter().map(|s| s.fps as u64).sum(),
            samples_collected: self.samples.len(),
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &MetricsSample> {
        self.samples.iter()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Медиана; для чётной длины среднее двух средних. Пустой набор даёт 0.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sorted = sorted(values);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Перцентиль по ближайшему рангу. Пустой набор даёт 0.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sorted = sorted(values);
    let rank = (p * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
