//! Summary event log: scalars, histograms and sample images keyed by step.

use crate::utils::{save_image_row, tensor_to_images};
use anyhow::{Context, Result};
use burn::module::{Module, ModuleVisitor, Param};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub const EVENTS_FILE: &str = "events.jsonl";
const HISTOGRAM_BUCKETS: usize = 30;

/// Bucketed distribution of a tensor's values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Histogram {
    pub name: String,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    /// Upper edge of each bucket.
    pub bucket_limits: Vec<f64>,
    pub bucket_counts: Vec<usize>,
}

impl Histogram {
    pub fn from_values(name: impl Into<String>, values: &[f32]) -> Self {
        let name = name.into();
        if values.is_empty() {
            return Self {
                name,
                count: 0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                std: 0.0,
                bucket_limits: Vec::new(),
                bucket_counts: Vec::new(),
            };
        }

        let count = values.len();
        let (mut min, mut max, mut sum) = (f64::MAX, f64::MIN, 0.0);
        for &v in values {
            let v = v as f64;
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / count as f64;
        let var = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        let width = (max - min) / HISTOGRAM_BUCKETS as f64;
        let mut bucket_counts = vec![0usize; HISTOGRAM_BUCKETS];
        for &v in values {
            let idx = if width > 0.0 {
                (((v as f64 - min) / width) as usize).min(HISTOGRAM_BUCKETS - 1)
            } else {
                0
            };
            bucket_counts[idx] += 1;
        }
        let bucket_limits = (1..=HISTOGRAM_BUCKETS)
            .map(|i| min + width * i as f64)
            .collect();

        Self {
            name,
            count,
            min,
            max,
            mean,
            std: var.sqrt(),
            bucket_limits,
            bucket_counts,
        }
    }

    /// L2 norm recovered from the summary statistics.
    pub fn l2_norm(&self) -> f64 {
        (self.count as f64 * (self.std.powi(2) + self.mean.powi(2))).sqrt()
    }
}

/// One line of the event log.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SummaryEvent {
    pub step: usize,
    pub wall_time: f64,
    pub scalars: BTreeMap<String, f64>,
    pub histograms: Vec<Histogram>,
    pub images: Vec<PathBuf>,
}

/// Appends summary events under `<logdir>/summaries`.
pub struct SummaryWriter {
    dir: PathBuf,
    events: BufWriter<File>,
}

impl SummaryWriter {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("images"))
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            dir,
            events: BufWriter::new(file),
        })
    }

    /// Save a batch in `[-1, 1]` BGR as `images/step_<step>_<tag>.png`.
    pub fn add_images<B: Backend>(
        &self,
        step: usize,
        tag: &str,
        images: Tensor<B, 4>,
    ) -> Result<PathBuf> {
        let images = tensor_to_images(images)?;
        let path = self
            .dir
            .join("images")
            .join(format!("step_{step:08}_{tag}.png"));
        save_image_row(&images, &path)?;
        Ok(path)
    }

    /// Append one event and flush it to disk.
    pub fn write(&mut self, event: &SummaryEvent) -> Result<()> {
        serde_json::to_writer(&mut self.events, event)?;
        self.events.write_all(b"\n")?;
        self.events.flush().context("failed to flush summary events")?;
        Ok(())
    }
}

pub fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Histograms of every float parameter in `module`, and of its gradient when
/// `grads` holds one.
pub fn parameter_histograms<B: AutodiffBackend, M: Module<B>>(
    prefix: &str,
    module: &M,
    grads: Option<&GradientsParams>,
) -> Vec<Histogram> {
    let mut collector = HistogramCollector::<B> {
        prefix,
        grads,
        index: 0,
        out: Vec::new(),
        _backend: std::marker::PhantomData,
    };
    module.visit(&mut collector);
    collector.out
}

struct HistogramCollector<'a, B: AutodiffBackend> {
    prefix: &'a str,
    grads: Option<&'a GradientsParams>,
    index: usize,
    out: Vec<Histogram>,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for HistogramCollector<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let value = param.val();
        let shape = value
            .dims()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x");
        let name = format!("{}/param_{:02}[{}]", self.prefix, self.index, shape);
        self.index += 1;

        if let Ok(values) = value.into_data().convert::<f32>().to_vec::<f32>() {
            self.out.push(Histogram::from_values(name.clone(), &values));
        }
        let grad = self
            .grads
            .and_then(|grads| grads.get::<B::InnerBackend, D>(param.id));
        if let Some(grad) = grad {
            if let Ok(values) = grad.into_data().convert::<f32>().to_vec::<f32>() {
                self.out
                    .push(Histogram::from_values(format!("{name}/grad"), &values));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn histogram_statistics() {
        let values: Vec<f32> = (0..10).map(|v| v as f32).collect();
        let hist = Histogram::from_values("x", &values);
        assert_eq!(hist.count, 10);
        assert_eq!(hist.min, 0.0);
        assert_eq!(hist.max, 9.0);
        assert!((hist.mean - 4.5).abs() < 1e-12);
        assert_eq!(hist.bucket_counts.iter().sum::<usize>(), 10);
        assert_eq!(hist.bucket_limits.len(), HISTOGRAM_BUCKETS);
        assert!((hist.bucket_limits[HISTOGRAM_BUCKETS - 1] - 9.0).abs() < 1e-9);
        let norm: f64 = values.iter().map(|&v| (v as f64).powi(2)).sum::<f64>().sqrt();
        assert!((hist.l2_norm() - norm).abs() < 1e-9);
    }

    #[test]
    fn constant_values_fall_in_one_bucket() {
        let hist = Histogram::from_values("c", &[2.0, 2.0, 2.0]);
        assert_eq!(hist.bucket_counts[0], 3);
        assert_eq!(hist.std, 0.0);
    }

    #[test]
    fn parameter_histograms_include_gradients() {
        let device = Default::default();
        let discriminator = ModelConfig::new()
            .with_image_size(16)
            .with_discriminator_dim(2)
            .init_discriminator::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);
        let loss = discriminator.forward(images).mean();
        let grads = GradientsParams::from_grads(loss.backward(), &discriminator);

        let hists = parameter_histograms("discriminator", &discriminator, Some(&grads));
        let params = hists.iter().filter(|h| !h.name.ends_with("/grad")).count();
        let grads = hists.iter().filter(|h| h.name.ends_with("/grad")).count();
        // Four convs and one linear, each with weight and bias.
        assert_eq!(params, 10);
        assert_eq!(grads, 10);
        assert!(hists[0].name.starts_with("discriminator/param_00"));
    }

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::open(dir.path()).unwrap();
        for step in [5, 10] {
            let mut scalars = BTreeMap::new();
            scalars.insert("gen_loss".to_string(), 1.5);
            writer
                .write(&SummaryEvent {
                    step,
                    wall_time: wall_time(),
                    scalars,
                    histograms: vec![Histogram::from_values("h", &[1.0, 2.0])],
                    images: Vec::new(),
                })
                .unwrap();
        }
        let contents = std::fs::read_to_string(dir.path().join(EVENTS_FILE)).unwrap();
        let events: Vec<SummaryEvent> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].step, 10);
        assert_eq!(events[0].scalars["gen_loss"], 1.5);
    }

    #[test]
    fn images_are_written_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SummaryWriter::open(dir.path()).unwrap();
        let images = Tensor::<NdArray<f32>, 4>::zeros([2, 3, 4, 4], &Default::default());
        let path = writer.add_images(3, "fake_image", images).unwrap();
        assert!(path.ends_with("images/step_00000003_fake_image.png"));
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (8, 4));
    }
}
