//! Граница с движком детекции объектов
//!
//! Сам движок внешний. Здесь типы результата, пересчёт координат из
//! letterbox-входа модели обратно в кадр и `detect_or_empty`: ошибка
//! инференса даёт пустой результат, а не фатальную ошибку.

use crate::error::Result;
use crate::metrics::{MetricsCollector, PerformanceMetrics};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

/// Сторона квадратного входа модели
pub const MODEL_INPUT_SIZE: u32 = 640;

/// Порог уверенности по умолчанию
pub const SCORE_THRESHOLD: f32 = 0.4;

/// Значений на одну строку выхода: xmin, ymin, xmax, ymax, score, class_id
const ROW_LEN: usize = 6;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// [xmin, ymin, xmax, ymax] в пикселях исходного кадра
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: u32,
    pub label: String,
}

/// RGBA кадр
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * 4
    }
}

#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, frame: &PixelBuffer) -> Result<Vec<Detection>>;
}

/// Ошибка движка превращается в пустой набор
pub async fn detect_or_empty(detector: &dyn ObjectDetector, frame: &PixelBuffer) -> Vec<Detection> {
    match detector.detect(frame).await {
        Ok(detections) => detections,
        Err(e) => {
            warn!(width = frame.width, height = frame.height, error = %e, "detection failed");
            Vec::new()
        }
    }
}

/// Детектор с учётом FPS и задержки; учитываются только успешные вызовы
pub struct MeteredDetector<D> {
    inner: D,
    metrics: Mutex<MetricsCollector>,
}

impl<D: ObjectDetector> MeteredDetector<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            metrics: Mutex::new(MetricsCollector::new()),
        }
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.collector().metrics()
    }

    pub fn reset_metrics(&self) {
        self.collector().reset();
    }

    fn collector(&self) -> std::sync::MutexGuard<'_, MetricsCollector> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<D: ObjectDetector> ObjectDetector for MeteredDetector<D> {
    async fn detect(&self, frame: &PixelBuffer) -> Result<Vec<Detection>> {
        let started = Instant::now();
        let detections = self.inner.detect(frame).await?;
        self.collector().add_frame(started.elapsed());
        Ok(detections)
    }
}

/// Масштаб и поля при вписывании кадра в квадратный вход модели
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn new(width: u32, height: u32, target: u32) -> Self {
        let target = target as f32;
        let scale = (target / width as f32).min(target / height as f32);
        Self {
            scale,
            pad_x: (target - width as f32 * scale) / 2.0,
            pad_y: (target - height as f32 * scale) / 2.0,
        }
    }
}

/// Разбор выхода модели `[N, 6]` в детекции в координатах кадра.
/// Строки ниже порога отбрасываются, неизвестные классы получают `Class N`.
pub fn decode_detections(
    output: &[f32],
    width: u32,
    height: u32,
    threshold: f32,
    labels: &HashMap<u32, String>,
) -> Vec<Detection> {
    let letterbox = Letterbox::new(width, height, MODEL_INPUT_SIZE);
    let (w, h) = (width as f32, height as f32);

    output
        .chunks_exact(ROW_LEN)
        .filter(|row| row[4] >= threshold)
        .map(|row| {
            let class_id = row[5].round().max(0.0) as u32;
            let unscale = |v: f32, pad: f32, max: f32| ((v - pad) / letterbox.scale).clamp(0.0, max);
            Detection {
                bbox: [
                    unscale(row[0], letterbox.pad_x, w),
                    unscale(row[1], letterbox.pad_y, h),
                    unscale(row[2], letterbox.pad_x, w),
                    unscale(row[3], letterbox.pad_y, h),
                ],
                score: row[4],
                class_id,
                label: labels
                    .get(&class_id)
                    .cloned()
                    .unwrap_or_else(|| format!("Class {}", class_id)),
            }
        })
        .collect()
}
