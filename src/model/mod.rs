pub mod discriminator;
pub mod encoder;
pub mod generator;

use crate::error::{ConfigError, EncoderRestoreError};
use crate::utils::{invprep, prep, subtract_mean};
use burn::module::{Ignored, ModuleVisitor, Param};
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::Distribution;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use encoder::{Encoder, EncoderConfig};
pub use generator::{Generator, GeneratorConfig};

/// Full-precision MessagePack recorder for every weight file the trainer reads or writes.
pub type WeightRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// File stem looked up when the encoder path is a directory.
pub const ENCODER_FILE: &str = "encoder";

/// Network sizes for the encoder, generator and discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 64)]
    pub image_size: usize,
    #[config(default = 32)]
    pub encoder_dim: usize,
    #[config(default = 256)]
    pub feature_dim: usize,
    #[config(default = 32)]
    pub generator_dim: usize,
    #[config(default = 32)]
    pub discriminator_dim: usize,
}

/// Weighting of the generator loss terms.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 1.0)]
    pub recon_weight: f64,
    #[config(default = 0.01)]
    pub feat_weight: f64,
    #[config(default = 0.001)]
    pub adversarial_weight: f64,
}

/// Linearly decaying noise added to the generator input.
#[derive(Config, Debug)]
pub struct NoiseConfig {
    #[config(default = 0.0078125)]
    pub base_sigma: f64,
    #[config(default = 500000)]
    pub horizon: usize,
}

impl NoiseConfig {
    /// `base_sigma * (1 - step / horizon)`, never below zero.
    pub fn sigma(&self, step: usize) -> f64 {
        if self.horizon == 0 || step >= self.horizon {
            return 0.0;
        }
        (self.base_sigma * (1.0 - step as f64 / self.horizon as f64)).max(0.0)
    }
}

/// Adversarial loss family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    Gan,
    Lsgan,
    Wgan,
}

impl Objective {
    /// Whether discriminator weights are clipped after every update.
    pub fn clips_weights(self) -> bool {
        matches!(self, Objective::Wgan)
    }
}

impl FromStr for Objective {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gan" => Ok(Objective::Gan),
            "lsgan" => Ok(Objective::Lsgan),
            "wgan" => Ok(Objective::Wgan),
            other => Err(ConfigError::UnknownObjective(other.to_string())),
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Objective::Gan => "gan",
            Objective::Lsgan => "lsgan",
            Objective::Wgan => "wgan",
        };
        f.write_str(name)
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_size == 0 || self.image_size % 16 != 0 {
            return Err(ConfigError::ImageSize(self.image_size));
        }
        Ok(())
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig::new(self.image_size, self.encoder_dim, self.feature_dim)
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.image_size, self.feature_dim, self.generator_dim)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.discriminator_dim, self.image_size)
    }

    pub fn init_encoder<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        self.encoder_config().init(device)
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        self.discriminator_config().init(device)
    }
}

/// Resolve the encoder checkpoint: a file, or a directory holding `encoder.mpk`.
pub fn encoder_checkpoint_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(format!("{ENCODER_FILE}.mpk"))
    } else {
        path.to_path_buf()
    }
}

/// Load the frozen encoder. Any failure is fatal to training.
pub fn restore_encoder<B: Backend>(
    model_config: &ModelConfig,
    path: &Path,
    device: &B::Device,
) -> Result<Encoder<B>, EncoderRestoreError> {
    let file = encoder_checkpoint_path(path);
    if !file.is_file() {
        return Err(EncoderRestoreError::Missing { path: file });
    }
    let fresh = model_config.init_encoder::<B>(device);
    let expected = parameter_shapes(&fresh);
    let encoder = fresh
        .load_file(file.clone(), &WeightRecorder::new(), device)
        .map_err(|source| EncoderRestoreError::Incompatible {
            path: file.clone(),
            source,
        })?;
    // Loading keeps whatever tensors the record holds, so compare shapes here.
    let found = parameter_shapes(&encoder);
    if found != expected {
        return Err(EncoderRestoreError::ShapeMismatch {
            path: file,
            expected,
            found,
        });
    }
    Ok(encoder.no_grad())
}

/// Shapes of every float parameter, in visiting order.
pub fn parameter_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut shapes = ShapeCollector(Vec::new());
    module.visit(&mut shapes);
    shapes.0
}

struct ShapeCollector(Vec<Vec<usize>>);

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.0.push(param.val().dims().to_vec());
    }
}

/// Encoder, generator and discriminator wired together.
#[derive(Module, Debug)]
pub struct DeepSimNet<B: Backend> {
    pub encoder: Encoder<B>,
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
    pub model_config: Ignored<ModelConfig>,
    pub loss_config: Ignored<LossConfig>,
    pub objective: Ignored<Objective>,
}

/// Named losses plus the tensors summaries need.
#[derive(Debug)]
pub struct DeepSimLosses<B: Backend> {
    pub reconstruction_loss: Tensor<B, 1>,
    pub feature_loss: Tensor<B, 1>,
    pub adversarial_generator_loss: Tensor<B, 1>,
    pub discriminator_loss: Tensor<B, 1>,
    pub generator_total_loss: Tensor<B, 1>,
    pub real_scores: Tensor<B, 2>,
    pub fake_scores: Tensor<B, 2>,
    /// Reconstruction in `[-1, 1]`.
    pub fake_image: Tensor<B, 4>,
    /// Input batch mapped to `[-1, 1]`.
    pub real_image: Tensor<B, 4>,
}

/// Discriminator-only pass; the generator output is detached.
#[derive(Debug)]
pub struct DiscriminatorLosses<B: Backend> {
    pub discriminator_loss: Tensor<B, 1>,
    pub real_scores: Tensor<B, 2>,
    pub fake_scores: Tensor<B, 2>,
}

impl<B: Backend> DeepSimNet<B> {
    pub fn new(
        encoder: Encoder<B>,
        model_config: ModelConfig,
        loss_config: LossConfig,
        objective: Objective,
        device: &B::Device,
    ) -> Self {
        let generator = model_config.init_generator(device);
        let discriminator = model_config.init_discriminator(device);
        Self {
            encoder,
            generator,
            discriminator,
            model_config: Ignored(model_config),
            loss_config: Ignored(loss_config),
            objective: Ignored(objective),
        }
    }

    /// Encode, perturb with noise and reconstruct. `images` are BGR in `[0, 255]`.
    pub fn reconstruct(&self, images: Tensor<B, 4>, noise_sigma: f64) -> Tensor<B, 4> {
        let features = self.encoder.forward(subtract_mean(images));
        self.generator.forward(perturb(features, noise_sigma))
    }

    /// Full forward pass producing every loss term.
    pub fn compute_losses(&self, images: Tensor<B, 4>, noise_sigma: f64) -> DeepSimLosses<B> {
        let loss_config = &self.loss_config;
        let real_features = self.encoder.forward(subtract_mean(images.clone()));
        let fake_image = self
            .generator
            .forward(perturb(real_features.clone(), noise_sigma));
        let real_image = prep(images);

        let reconstruction_loss = fake_image
            .clone()
            .sub(real_image.clone())
            .square()
            .mean();
        let fake_features = self
            .encoder
            .forward(subtract_mean(invprep(fake_image.clone())));
        let feature_loss = fake_features.sub(real_features).square().mean();

        let real_scores = self.discriminator.forward(real_image.clone());
        let fake_scores = self.discriminator.forward(fake_image.clone());
        let discriminator_loss =
            discriminator_objective(*self.objective, real_scores.clone(), fake_scores.clone());
        let adversarial_generator_loss = generator_objective(*self.objective, fake_scores.clone());

        let generator_total_loss = reconstruction_loss
            .clone()
            .mul_scalar(loss_config.recon_weight)
            .add(feature_loss.clone().mul_scalar(loss_config.feat_weight))
            .add(
                adversarial_generator_loss
                    .clone()
                    .mul_scalar(loss_config.adversarial_weight),
            );

        DeepSimLosses {
            reconstruction_loss,
            feature_loss,
            adversarial_generator_loss,
            discriminator_loss,
            generator_total_loss,
            real_scores,
            fake_scores,
            fake_image,
            real_image,
        }
    }

    /// Scores and discriminator loss with the reconstruction cut from the graph.
    pub fn compute_discriminator_loss(
        &self,
        images: Tensor<B, 4>,
        noise_sigma: f64,
    ) -> DiscriminatorLosses<B> {
        let fake_image = self.reconstruct(images.clone(), noise_sigma).detach();
        let real_scores = self.discriminator.forward(prep(images));
        let fake_scores = self.discriminator.forward(fake_image);
        let discriminator_loss =
            discriminator_objective(*self.objective, real_scores.clone(), fake_scores.clone());
        DiscriminatorLosses {
            discriminator_loss,
            real_scores,
            fake_scores,
        }
    }
}

fn perturb<B: Backend>(features: Tensor<B, 2>, sigma: f64) -> Tensor<B, 2> {
    if sigma <= 0.0 {
        return features;
    }
    let noise = Tensor::random(
        features.dims(),
        Distribution::Normal(0.0, sigma),
        &features.device(),
    );
    features.add(noise)
}

/// Discriminator (critic) term of the adversarial objective.
pub fn discriminator_objective<B: Backend>(
    objective: Objective,
    real_scores: Tensor<B, 2>,
    fake_scores: Tensor<B, 2>,
) -> Tensor<B, 1> {
    match objective {
        Objective::Gan => {
            let device = real_scores.device();
            let bce = BinaryCrossEntropyLossConfig::new()
                .with_logits(true)
                .init(&device);
            let ones = Tensor::<B, 2, Int>::ones(real_scores.dims(), &device);
            let zeros = Tensor::<B, 2, Int>::zeros(fake_scores.dims(), &device);
            bce.forward(real_scores, ones)
                .add(bce.forward(fake_scores, zeros))
        }
        Objective::Lsgan => real_scores
            .sub_scalar(1.0)
            .square()
            .mean()
            .add(fake_scores.square().mean()),
        Objective::Wgan => fake_scores.mean().sub(real_scores.mean()),
    }
}

/// Generator term of the adversarial objective.
pub fn generator_objective<B: Backend>(objective: Objective, fake_scores: Tensor<B, 2>) -> Tensor<B, 1> {
    match objective {
        Objective::Gan => {
            let device = fake_scores.device();
            let bce = BinaryCrossEntropyLossConfig::new()
                .with_logits(true)
                .init(&device);
            let ones = Tensor::<B, 2, Int>::ones(fake_scores.dims(), &device);
            bce.forward(fake_scores, ones)
        }
        Objective::Lsgan => fake_scores.sub_scalar(1.0).square().mean(),
        Objective::Wgan => fake_scores.mean().neg(),
    }
}
