use anyhow::Result;
use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module, ModuleVisitor, Param};
use burn::prelude::*;
use deepsim_burn::checkpoint::{CheckpointStore, INDEX_FILE};
use burn::data::dataset::Dataset;
use deepsim_burn::data::{BatchSource, DataSupplier, Example, ExampleBatcher};
use deepsim_burn::error::EncoderRestoreError;
use deepsim_burn::model::{ModelConfig, Objective, WeightRecorder, ENCODER_FILE};
use deepsim_burn::summary::EVENTS_FILE;
use deepsim_burn::training::{test, train, Phase, StopSignal, Trainer, TrainingConfig};
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

const DATASET: &str = "toy";

fn tiny_model() -> ModelConfig {
    ModelConfig::new()
        .with_image_size(16)
        .with_encoder_dim(2)
        .with_feature_dim(8)
        .with_generator_dim(2)
        .with_discriminator_dim(2)
}

/// Writes a few PNGs, their manifest and a random encoder into `root`.
fn fixture(root: &Path) -> TrainingConfig {
    let data_root = root.join("data");
    std::fs::create_dir_all(data_root.join("images")).unwrap();
    let mut images = Vec::new();
    for i in 0..6u8 {
        let name = format!("images/{i}.png");
        RgbImage::from_fn(20, 20, |x, y| Rgb([i * 40, (x * 12) as u8, (y * 12) as u8]))
            .save(data_root.join(&name))
            .unwrap();
        images.push(serde_json::json!({ "path": name, "classes": [usize::from(i % 2)] }));
    }
    let manifest = serde_json::json!({ "num_classes": 2, "images": images });
    std::fs::write(
        data_root.join(format!("{DATASET}.json")),
        serde_json::to_string(&manifest).unwrap(),
    )
    .unwrap();

    let encoder_dir = root.join("encoder");
    std::fs::create_dir_all(&encoder_dir).unwrap();
    tiny_model()
        .init_encoder::<TestBackend>(&Default::default())
        .save_file(encoder_dir.join(ENCODER_FILE), &WeightRecorder::new())
        .unwrap();

    TrainingConfig::new(
        root.join("logs").to_string_lossy().into_owned(),
        encoder_dir.to_string_lossy().into_owned(),
        DATASET.to_string(),
        data_root.to_string_lossy().into_owned(),
    )
    .with_model(tiny_model())
    .with_batch_size(2)
    .with_load_size(18)
    .with_iters(10)
    .with_save_freq(5)
    .with_show_freq(5)
    .with_summ_freq(5)
    .with_critic_iters(3)
    .with_prefetch_workers(1)
    .with_prefetch_capacity(2)
}

fn supplier(config: &TrainingConfig) -> DataSupplier {
    let database = config.open_database().unwrap();
    DataSupplier::new(
        Arc::new(database),
        config.data_config(),
        config.batch_size,
        config.seed,
    )
    .unwrap()
}

/// Counts how many batches the trainer pulls.
struct CountingSource<S> {
    inner: S,
    drawn: usize,
}

impl<S: BatchSource> BatchSource for CountingSource<S> {
    fn next_batch(&mut self) -> Result<Vec<Example>> {
        self.drawn += 1;
        self.inner.next_batch()
    }

    fn batcher(&self) -> ExampleBatcher {
        self.inner.batcher()
    }
}

/// Smallest and largest value over every float parameter.
struct ValueRange {
    min: f32,
    max: f32,
}

impl<B: Backend> ModuleVisitor<B> for ValueRange {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let values = param.val().into_data().to_vec::<f32>().unwrap();
        for value in values {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }
}

fn generator_output(trainer: &Trainer<TestAutodiffBackend>) -> Vec<f32> {
    let generator = trainer.net().generator.valid();
    let features = Tensor::<TestBackend, 2>::ones([2, 8], &Default::default());
    generator
        .forward(features)
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

fn event_lines(config: &TrainingConfig) -> usize {
    let events = Path::new(&config.logdir).join("summaries").join(EVENTS_FILE);
    std::fs::read_to_string(events).unwrap().lines().count()
}

#[test]
fn full_run_fires_periodic_actions() {
    let dir = TempDir::new().unwrap();
    let config = fixture(dir.path());

    let report = train::<TestAutodiffBackend>(config.clone(), Default::default(), &StopSignal::new())
        .unwrap();

    assert_eq!(report.start_step, 0);
    assert_eq!(report.final_step, 10);
    assert!(!report.interrupted);
    assert_eq!(report.counts.generator_updates, 10);
    assert_eq!(report.counts.discriminator_updates, 10);
    assert_eq!(report.counts.clips, 0);
    assert_eq!(report.shows, 2);
    assert_eq!(report.summaries, 2);
    assert_eq!(report.checkpoints.len(), 2);
    assert_eq!(event_lines(&config), 2);

    let logdir = Path::new(&config.logdir);
    assert!(logdir.join("config.json").is_file());
    assert!(logdir.join(INDEX_FILE).is_file());
    let store = CheckpointStore::new(logdir);
    assert_eq!(store.latest().unwrap().map(|(step, _)| step), Some(10));
    assert_eq!(
        store.list().unwrap(),
        vec![logdir.join("model-5"), logdir.join("model-10")]
    );
}

#[test]
fn wgan_step_runs_every_critic_iteration_with_clipping() {
    let dir = TempDir::new().unwrap();
    let config = fixture(dir.path())
        .with_objective(Objective::Wgan)
        .with_iters(1);
    let mut source = CountingSource {
        inner: supplier(&config),
        drawn: 0,
    };

    let mut trainer =
        Trainer::<TestAutodiffBackend>::new(config.clone(), Default::default()).unwrap();
    let report = trainer.run(&mut source, &StopSignal::new()).unwrap();

    assert_eq!(report.counts.generator_updates, 1);
    assert_eq!(report.counts.discriminator_updates, 3);
    assert_eq!(report.counts.clips, 3);
    let mut range = ValueRange {
        min: f32::MAX,
        max: f32::MIN,
    };
    trainer.net().discriminator.visit(&mut range);
    assert!(range.min >= config.clip_low as f32, "min {} below clip", range.min);
    assert!(range.max <= config.clip_high as f32, "max {} above clip", range.max);

    let mut initial = ValueRange {
        min: f32::MAX,
        max: f32::MIN,
    };
    tiny_model()
        .init_discriminator::<TestBackend>(&Default::default())
        .visit(&mut initial);
    assert!(initial.min < config.clip_low as f32 || initial.max > config.clip_high as f32);
    // One batch for the generator, then a fresh one per critic iteration.
    assert_eq!(source.drawn, 4);
    assert_eq!(trainer.phase(), Phase::Stopped);
}

#[test]
fn gan_discriminator_reuses_the_generator_batch() {
    let dir = TempDir::new().unwrap();
    let config = fixture(dir.path())
        .with_objective(Objective::Lsgan)
        .with_iters(3)
        .with_summ_freq(1);
    let mut source = CountingSource {
        inner: supplier(&config),
        drawn: 0,
    };

    let mut trainer = Trainer::<TestAutodiffBackend>::new(config.clone(), Default::default()).unwrap();
    let report = trainer.run(&mut source, &StopSignal::new()).unwrap();

    assert_eq!(source.drawn, 3);
    assert_eq!(report.counts.discriminator_updates, 3);
    assert_eq!(report.summaries, 3);
    assert_eq!(event_lines(&config), 3);
}

#[test]
fn resume_continues_from_latest_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = fixture(dir.path()).with_iters(4).with_save_freq(2);

    let mut first = Trainer::<TestAutodiffBackend>::new(config.clone(), Default::default()).unwrap();
    first.run(&mut supplier(&config), &StopSignal::new()).unwrap();
    assert_eq!(first.step(), 4);

    let resumed_config = config.clone().with_iters(6);
    let mut second =
        Trainer::<TestAutodiffBackend>::new(resumed_config.clone(), Default::default()).unwrap();
    assert_eq!(second.step(), 4);
    assert_eq!(generator_output(&first), generator_output(&second));

    let report = second
        .run(&mut supplier(&resumed_config), &StopSignal::new())
        .unwrap();
    assert_eq!(report.start_step, 4);
    assert_eq!(report.final_step, 6);
    assert_eq!(report.counts.generator_updates, 2);
}

#[test]
fn missing_encoder_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = fixture(dir.path());
    let config = TrainingConfig {
        encoder: dir.path().join("absent").to_string_lossy().into_owned(),
        ..config.clone()
    };

    let err = match Trainer::<TestAutodiffBackend>::new(config.clone(), Default::default()) {
        Ok(_) => panic!("trainer built without an encoder"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<EncoderRestoreError>(),
        Some(EncoderRestoreError::Missing { .. })
    ));
    assert!(train::<TestAutodiffBackend>(config, Default::default(), &StopSignal::new()).is_err());
}

#[test]
fn stop_request_ends_after_the_current_step() {
    let dir = TempDir::new().unwrap();
    let config = fixture(dir.path()).with_objective(Objective::Wgan);
    let stop = StopSignal::new();
    stop.stop();

    let mut trainer = Trainer::<TestAutodiffBackend>::new(config.clone(), Default::default()).unwrap();
    let report = trainer.run(&mut supplier(&config), &stop).unwrap();

    assert!(report.interrupted);
    assert_eq!(report.final_step, 1);
    assert_eq!(report.counts.generator_updates, 1);
    assert_eq!(report.counts.discriminator_updates, 3);
    assert!(report.checkpoints.is_empty());
}

#[test]
fn frozen_encoder_is_untouched_by_training() {
    let dir = TempDir::new().unwrap();
    let config = fixture(dir.path()).with_iters(3);
    let mut trainer = Trainer::<TestAutodiffBackend>::new(config.clone(), Default::default()).unwrap();
    let images = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &Default::default());
    let before = trainer
        .net()
        .encoder
        .valid()
        .forward(images.clone())
        .into_data()
        .to_vec::<f32>()
        .unwrap();

    trainer.run(&mut supplier(&config), &StopSignal::new()).unwrap();

    let after = trainer
        .net()
        .encoder
        .valid()
        .forward(images)
        .into_data()
        .to_vec::<f32>()
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_mode_writes_reconstructions() {
    let dir = TempDir::new().unwrap();
    let config = fixture(dir.path()).with_iters(5);
    train::<TestAutodiffBackend>(config.clone(), Default::default(), &StopSignal::new()).unwrap();

    let path = test::<TestBackend>(config.clone(), Default::default()).unwrap();
    assert_eq!(path, Path::new(&config.logdir).join("test").join("reconstruction_5.png"));
    let grid = image::open(&path).unwrap();
    assert_eq!((grid.width(), grid.height()), (32, 32));

    let database = config.open_database().unwrap();
    assert_eq!(database.len(), 6);
}
