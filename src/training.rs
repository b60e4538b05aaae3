use crate::checkpoint::CheckpointStore;
use crate::data::{BatchSource, DataConfig, DataSupplier, Example, ImageBatch, ManifestDatabase};
use crate::error::ConfigError;
use crate::model::{
    restore_encoder, DeepSimLosses, DeepSimNet, LossConfig, ModelConfig, NoiseConfig, Objective,
};
use crate::optim::{ClipRange, GanOptimizer, OptimConfig};
use crate::prefetch::{PrefetchConfig, Prefetcher};
use crate::summary::{parameter_histograms, wall_time, Histogram, SummaryEvent, SummaryWriter};
use crate::utils::{merge_images, prep, tensor_to_images};
use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What the process does with the log directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Test,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Mode::Train),
            "test" => Ok(Mode::Test),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => f.write_str("train"),
            Mode::Test => f.write_str("test"),
        }
    }
}

/// Resolved run configuration, dumped to `<logdir>/config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub logdir: String,
    /// Encoder checkpoint file, or a directory holding `encoder.mpk`.
    pub encoder: String,
    pub dataset_name: String,
    pub data_root: String,
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
    #[config(default = "OptimConfig::new()")]
    pub optim: OptimConfig,
    #[config(default = "NoiseConfig::new()")]
    pub noise: NoiseConfig,
    #[config(default = "Objective::Gan")]
    pub objective: Objective,
    #[config(default = "Mode::Train")]
    pub mode: Mode,
    #[config(default = 200000)]
    pub iters: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 72)]
    pub load_size: usize,
    #[config(default = 123456789)]
    pub seed: u64,
    #[config(default = 50000)]
    pub save_freq: usize,
    #[config(default = 50)]
    pub show_freq: usize,
    #[config(default = 100)]
    pub summ_freq: usize,
    #[config(default = "-0.05")]
    pub clip_low: f64,
    #[config(default = 0.05)]
    pub clip_high: f64,
    #[config(default = 5)]
    pub critic_iters: usize,
    /// More than one worker trades strict pass order for throughput.
    #[config(default = 1)]
    pub prefetch_workers: usize,
    #[config(default = 8)]
    pub prefetch_capacity: usize,
    #[config(default = false)]
    pub debug: bool,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        let positive = [
            ("batch_size", self.batch_size),
            ("save_freq", self.save_freq),
            ("show_freq", self.show_freq),
            ("summ_freq", self.summ_freq),
            ("critic_iters", self.critic_iters),
            ("prefetch_workers", self.prefetch_workers),
            ("prefetch_capacity", self.prefetch_capacity),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { name });
        }
        if self.clip_low > self.clip_high {
            return Err(ConfigError::InvertedClip {
                low: self.clip_low,
                high: self.clip_high,
            });
        }
        if self.load_size < self.model.image_size {
            return Err(ConfigError::LoadSize {
                load_size: self.load_size,
                image_size: self.model.image_size,
            });
        }
        Ok(())
    }

    pub fn cadence(&self) -> Cadence {
        Cadence {
            show_freq: self.show_freq,
            save_freq: self.save_freq,
            summ_freq: self.summ_freq,
        }
    }

    /// Critic clip range; only Wasserstein training clips.
    pub fn clip_range(&self) -> Option<ClipRange> {
        self.objective.clips_weights().then_some(ClipRange {
            low: self.clip_low,
            high: self.clip_high,
        })
    }

    /// Discriminator updates per generator update.
    pub fn discriminator_updates_per_step(&self) -> usize {
        match self.objective {
            Objective::Wgan => self.critic_iters,
            Objective::Gan | Objective::Lsgan => 1,
        }
    }

    pub fn data_config(&self) -> DataConfig {
        DataConfig {
            image_size: self.model.image_size as u32,
            load_size: self.load_size as u32,
        }
    }

    pub fn prefetch_config(&self) -> PrefetchConfig {
        PrefetchConfig {
            workers: self.prefetch_workers,
            capacity: self.prefetch_capacity,
        }
    }

    pub fn open_database(&self) -> Result<ManifestDatabase> {
        let database = ManifestDatabase::open(Path::new(&self.data_root), &self.dataset_name)
            .with_context(|| format!("failed to load dataset {}", self.dataset_name))?;
        info!(
            "dataset {} -> {} images, {} classes",
            self.dataset_name,
            database.len(),
            database.num_classes()
        );
        Ok(database)
    }
}

/// How often the periodic actions fire.
#[derive(Clone, Copy, Debug)]
pub struct Cadence {
    pub show_freq: usize,
    pub save_freq: usize,
    pub summ_freq: usize,
}

/// Periodic actions due after a given step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepPlan {
    pub show: bool,
    pub save: bool,
    pub summarize: bool,
}

impl StepPlan {
    pub fn for_step(step: usize, cadence: Cadence) -> Self {
        let due = |freq: usize| freq > 0 && step % freq == 0;
        Self {
            show: due(cadence.show_freq),
            save: due(cadence.save_freq),
            summarize: due(cadence.summ_freq),
        }
    }
}

/// Orchestrator state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Showing,
    Saving,
    Summarizing,
    Stopped,
}

/// Cooperative stop request, checked between steps.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Scalar losses read back from the device.
#[derive(Clone, Debug, PartialEq)]
pub struct LossSnapshot {
    pub gen_loss: f64,
    pub dis_loss: f64,
    pub gen_dis_loss: f64,
    pub recon_loss: f64,
    pub feat_loss: f64,
    pub real_score: f64,
    pub fake_score: f64,
}

impl LossSnapshot {
    fn from_losses<B: Backend>(losses: &DeepSimLosses<B>) -> Self {
        let scalar = |t: &Tensor<B, 1>| t.clone().into_scalar().elem::<f64>();
        Self {
            gen_loss: scalar(&losses.generator_total_loss),
            dis_loss: scalar(&losses.discriminator_loss),
            gen_dis_loss: scalar(&losses.adversarial_generator_loss),
            recon_loss: scalar(&losses.reconstruction_loss),
            feat_loss: scalar(&losses.feature_loss),
            real_score: scalar(&losses.real_scores.clone().mean()),
            fake_score: scalar(&losses.fake_scores.clone().mean()),
        }
    }
}

/// Update counters since the trainer was built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateCounts {
    pub generator_updates: usize,
    pub discriminator_updates: usize,
    pub clips: usize,
}

/// Result of one training step. Optional fields are filled per [`StepPlan`].
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub step: usize,
    pub plan: StepPlan,
    pub losses: Option<LossSnapshot>,
    pub checkpoint: Option<PathBuf>,
    pub summary_images: Option<Vec<PathBuf>>,
}

/// Summary of a call to [`Trainer::run`].
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub start_step: usize,
    pub final_step: usize,
    pub counts: UpdateCounts,
    pub shows: usize,
    pub summaries: usize,
    pub checkpoints: Vec<PathBuf>,
    pub interrupted: bool,
}

impl RunReport {
    fn record(&mut self, outcome: &StepOutcome) {
        self.final_step = outcome.step;
        if outcome.plan.show {
            self.shows += 1;
        }
        if outcome.summary_images.is_some() {
            self.summaries += 1;
        }
        if let Some(path) = &outcome.checkpoint {
            self.checkpoints.push(path.clone());
        }
    }
}

/// Drives alternating generator/discriminator updates plus the periodic
/// display, checkpoint and summary actions.
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    net: DeepSimNet<B>,
    optim: GanOptimizer<B>,
    checkpoints: CheckpointStore,
    summaries: SummaryWriter,
    device: B::Device,
    step: usize,
    counts: UpdateCounts,
    phase: Phase,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Restore the frozen encoder (fatal on failure), then resume from the
    /// latest checkpoint in the log directory if there is one.
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        let logdir = PathBuf::from(&config.logdir);
        std::fs::create_dir_all(&logdir)
            .with_context(|| format!("failed to create {}", logdir.display()))?;

        debug!("phase {:?}", Phase::Initializing);
        info!("Initializing net, optimizers and summaries...");
        let encoder = restore_encoder::<B>(&config.model, Path::new(&config.encoder), &device)?;
        let mut net = DeepSimNet::new(
            encoder,
            config.model.clone(),
            config.loss.clone(),
            config.objective,
            &device,
        );

        let checkpoints = CheckpointStore::new(&logdir);
        let mut step = 0;
        if let Some(restored) =
            checkpoints.restore(net.generator.clone(), net.discriminator.clone(), &device)?
        {
            net.generator = restored.generator;
            net.discriminator = restored.discriminator;
            step = restored.step;
            info!("deepSimNet restored at step {step}");
        }

        let optim = GanOptimizer::new(&config.optim, config.clip_range());
        let summaries = SummaryWriter::open(logdir.join("summaries"))?;

        Ok(Self {
            config,
            net,
            optim,
            checkpoints,
            summaries,
            device,
            step,
            counts: UpdateCounts::default(),
            phase: Phase::Initializing,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn counts(&self) -> UpdateCounts {
        self.counts
    }

    pub fn net(&self) -> &DeepSimNet<B> {
        &self.net
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train until `iters` or until `stop` is raised. A stop request takes
    /// effect after the in-flight step has finished all of its updates.
    pub fn run<S: BatchSource>(&mut self, source: &mut S, stop: &StopSignal) -> Result<RunReport> {
        self.enter(Phase::Running);
        let start_step = self.step;
        let started = Instant::now();
        let mut report = RunReport {
            start_step,
            final_step: start_step,
            ..Default::default()
        };

        for step in start_step + 1..=self.config.iters {
            let outcome = self.train_step(source, step, start_step, started)?;
            report.record(&outcome);
            if stop.should_stop() {
                info!("End Training...");
                report.interrupted = true;
                break;
            }
        }

        self.enter(Phase::Stopped);
        report.counts = self.counts;
        Ok(report)
    }

    /// One generator update followed by the objective's discriminator updates.
    pub fn train_step<S: BatchSource>(
        &mut self,
        source: &mut S,
        step: usize,
        start_step: usize,
        started: Instant,
    ) -> Result<StepOutcome> {
        let plan = StepPlan::for_step(step, self.config.cadence());
        let noise_sigma = self.config.noise.sigma(step);
        // Updates completed before this step; drives the learning-rate decay.
        let global_step = step - 1;

        let images = self.next_images(source)?;
        let losses = self.net.compute_losses(images.clone(), noise_sigma);
        let snapshot = (plan.show || plan.summarize).then(|| LossSnapshot::from_losses(&losses));

        let gen_grads = GradientsParams::from_grads(
            losses.generator_total_loss.clone().backward(),
            &self.net.generator,
        );
        let mut histograms = Vec::new();
        if plan.summarize || self.config.debug {
            histograms = parameter_histograms("generator", &self.net.generator, Some(&gen_grads));
        }
        self.net.generator =
            self.optim
                .apply_generator(global_step, self.net.generator.clone(), gen_grads);
        self.counts.generator_updates += 1;

        let critic_iters = self.config.discriminator_updates_per_step();
        for iter in 0..critic_iters {
            let images = match self.config.objective {
                Objective::Wgan => self.next_images(source)?,
                Objective::Gan | Objective::Lsgan => images.clone(),
            };
            let collect = (plan.summarize || self.config.debug) && iter + 1 == critic_iters;
            let disc_histograms =
                self.update_discriminator(images, noise_sigma, global_step, collect);
            histograms.extend(disc_histograms);
        }

        if self.config.debug {
            log_grad_norms(step, &histograms);
        }
        self.step = step;

        let mut outcome = StepOutcome {
            step,
            plan,
            losses: snapshot,
            checkpoint: None,
            summary_images: None,
        };

        if plan.show {
            self.enter(Phase::Showing);
            if let Some(losses) = &outcome.losses {
                self.show(step, losses, start_step, started);
            }
        }
        if plan.save {
            self.enter(Phase::Saving);
            info!("================ saving model =================");
            let path =
                self.checkpoints
                    .save(step, &self.net.generator, &self.net.discriminator)?;
            outcome.checkpoint = Some(path);
        }
        if plan.summarize {
            self.enter(Phase::Summarizing);
            info!("-------------- recording summary --------------");
            let images = self.summarize(step, noise_sigma, &losses, outcome.losses.as_ref(), histograms)?;
            outcome.summary_images = Some(images);
        }
        self.enter(Phase::Running);

        Ok(outcome)
    }

    fn next_images<S: BatchSource>(&self, source: &mut S) -> Result<Tensor<B, 4>> {
        let examples = source.next_batch()?;
        let batch =
            Batcher::<B, Example, ImageBatch<B>>::batch(&source.batcher(), examples, &self.device);
        Ok(batch.images)
    }

    fn update_discriminator(
        &mut self,
        images: Tensor<B, 4>,
        noise_sigma: f64,
        global_step: usize,
        collect_histograms: bool,
    ) -> Vec<Histogram> {
        let losses = self.net.compute_discriminator_loss(images, noise_sigma);
        let grads = GradientsParams::from_grads(
            losses.discriminator_loss.backward(),
            &self.net.discriminator,
        );
        let histograms = if collect_histograms {
            parameter_histograms("discriminator", &self.net.discriminator, Some(&grads))
        } else {
            Vec::new()
        };
        self.net.discriminator =
            self.optim
                .apply_discriminator(global_step, self.net.discriminator.clone(), grads);
        self.counts.discriminator_updates += 1;
        if self.optim.clip().is_some() {
            self.counts.clips += 1;
        }
        histograms
    }

    fn show(&self, step: usize, losses: &LossSnapshot, start_step: usize, started: Instant) {
        let done = (step - start_step) as f64;
        let rate = done / started.elapsed().as_secs_f64().max(f64::EPSILON);
        let remaining = (self.config.iters + 1 - step) as f64 / rate;
        info!(
            " step {:6} , dis_loss: {:.6} , gen_dis_loss: {:.6} , recon_loss: {:.6} , feat_loss: {:.6}, remaining {:5}m",
            step,
            losses.dis_loss,
            losses.gen_dis_loss,
            losses.recon_loss,
            losses.feat_loss,
            (remaining / 60.0) as u64
        );
    }

    fn summarize(
        &mut self,
        step: usize,
        noise_sigma: f64,
        losses: &DeepSimLosses<B>,
        snapshot: Option<&LossSnapshot>,
        histograms: Vec<Histogram>,
    ) -> Result<Vec<PathBuf>> {
        let mut scalars = BTreeMap::new();
        if let Some(s) = snapshot {
            scalars.insert("gen_loss".to_string(), s.gen_loss);
            scalars.insert("dis_loss".to_string(), s.dis_loss);
            scalars.insert("G/gen_dis_loss".to_string(), s.gen_dis_loss);
            scalars.insert("G/recon_loss".to_string(), s.recon_loss);
            scalars.insert("G/feat_loss".to_string(), s.feat_loss);
            scalars.insert("real_score".to_string(), s.real_score);
            scalars.insert("fake_score".to_string(), s.fake_score);
        }
        scalars.insert("learning_rate".to_string(), self.optim.generator_lr(step - 1));
        scalars.insert("noise_sigma".to_string(), noise_sigma);

        let images = vec![
            self.summaries
                .add_images(step, "real_image", losses.real_image.clone())?,
            self.summaries
                .add_images(step, "fake_image", losses.fake_image.clone())?,
        ];

        self.summaries.write(&SummaryEvent {
            step,
            wall_time: wall_time(),
            scalars,
            histograms,
            images: images.clone(),
        })?;
        Ok(images)
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }
}

fn log_grad_norms(step: usize, histograms: &[Histogram]) {
    for group in ["generator", "discriminator"] {
        let norm = histograms
            .iter()
            .filter(|h| h.name.starts_with(group) && h.name.ends_with("/grad"))
            .map(|h| h.l2_norm().powi(2))
            .sum::<f64>()
            .sqrt();
        debug!("step {step} {group} grad norm {norm:.6}");
    }
}

/// Train from `config`, feeding the loop from background data workers.
pub fn train<B: AutodiffBackend>(
    config: TrainingConfig,
    device: B::Device,
    stop: &StopSignal,
) -> Result<RunReport> {
    config.validate()?;
    let logdir = PathBuf::from(&config.logdir);
    std::fs::create_dir_all(&logdir)
        .with_context(|| format!("failed to create {}", logdir.display()))?;
    config
        .save(logdir.join("config.json"))
        .context("failed to write config.json")?;
    info!("{config}");

    B::seed(&device, config.seed);
    let mut trainer = Trainer::<B>::new(config.clone(), device)?;

    let database = config.open_database()?;
    let supplier = DataSupplier::new(
        Arc::new(database),
        config.data_config(),
        config.batch_size,
        config.seed,
    )?;
    let mut prefetcher = Prefetcher::start(supplier, config.prefetch_config())?;

    let result = trainer.run(&mut prefetcher, stop);
    prefetcher.stop(Duration::from_secs(10));
    let report = result?;
    info!(
        "stopped at step {} ({} generator / {} discriminator updates)",
        report.final_step, report.counts.generator_updates, report.counts.discriminator_updates
    );
    Ok(report)
}

/// Reconstruct one batch with the latest checkpoint and save real/fake rows
/// to `<logdir>/test/`.
pub fn test<B: Backend>(config: TrainingConfig, device: B::Device) -> Result<PathBuf> {
    config.validate()?;
    let logdir = PathBuf::from(&config.logdir);
    B::seed(&device, config.seed);

    let encoder = restore_encoder::<B>(&config.model, Path::new(&config.encoder), &device)?;
    let mut net = DeepSimNet::new(
        encoder,
        config.model.clone(),
        config.loss.clone(),
        config.objective,
        &device,
    );
    let restored = CheckpointStore::new(&logdir).restore_required(
        net.generator.clone(),
        net.discriminator.clone(),
        &device,
    )?;
    net.generator = restored.generator;

    let database = config.open_database()?;
    let mut supplier = DataSupplier::new(
        Arc::new(database),
        config.data_config(),
        config.batch_size,
        config.seed,
    )?;
    let examples = supplier.next_batch()?;
    let batch_size = examples.len();
    let batch =
        Batcher::<B, Example, ImageBatch<B>>::batch(&supplier.batcher(), examples, &device);
    let images = batch.images;
    let fake = net.reconstruct(images.clone(), 0.0);

    let mut tiles = tensor_to_images(prep(images))?;
    tiles.extend(tensor_to_images(fake)?);
    let grid = merge_images(&tiles, 2, batch_size)?;

    let out_dir = logdir.join("test");
    std::fs::create_dir_all(&out_dir)?;
    let path = out_dir.join(format!("reconstruction_{}.png", restored.step));
    grid.save(&path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    info!("saved reconstructions to {}", path.display());
    Ok(path)
}
