//! Learning-rate schedule, per-group optimizers and critic weight clipping.

use crate::error::ConfigError;
use crate::model::{Discriminator, Generator};
use burn::module::{AutodiffModule, Module, ModuleMapper, Param};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer, RmsProp, RmsPropConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Optimizer family shared by both parameter groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Adam,
    #[serde(rename = "RMS")]
    Rms,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Adam" => Ok(OptimizerKind::Adam),
            "RMS" => Ok(OptimizerKind::Rms),
            other => Err(ConfigError::UnknownOptimizer(other.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam => f.write_str("Adam"),
            OptimizerKind::Rms => f.write_str("RMS"),
        }
    }
}

/// Optimizer hyperparameters.
#[derive(Config, Debug)]
pub struct OptimConfig {
    #[config(default = "OptimizerKind::Adam")]
    pub optimizer: OptimizerKind,
    #[config(default = 0.002)]
    pub learning_rate: f64,
    #[config(default = 0.96)]
    pub lr_decay: f64,
    #[config(default = 100000)]
    pub decay_steps: usize,
    /// Adam beta1, or the RMSProp averaging decay.
    #[config(default = 0.5)]
    pub beta1: f64,
    /// Discriminator learning rate relative to the generator's.
    #[config(default = 0.1)]
    pub discriminator_lr_scale: f64,
}

/// Staircase exponential decay, a pure function of the step counter.
#[derive(Clone, Copy, Debug)]
pub struct LrSchedule {
    pub base: f64,
    pub decay_rate: f64,
    pub decay_steps: usize,
}

impl LrSchedule {
    pub fn at(&self, step: usize) -> f64 {
        let periods = if self.decay_steps == 0 {
            0
        } else {
            step / self.decay_steps
        };
        self.base * self.decay_rate.powi(periods as i32)
    }
}

/// One optimizer instance, whichever family was configured.
pub enum ModuleOptimizer<M: AutodiffModule<B>, B: AutodiffBackend> {
    Adam(OptimizerAdaptor<Adam, M, B>),
    Rms(OptimizerAdaptor<RmsProp, M, B>),
}

impl<M: AutodiffModule<B>, B: AutodiffBackend> ModuleOptimizer<M, B> {
    pub fn new(config: &OptimConfig) -> Self {
        match config.optimizer {
            OptimizerKind::Adam => ModuleOptimizer::Adam(
                AdamConfig::new()
                    .with_beta_1(config.beta1 as f32)
                    .init::<B, M>(),
            ),
            OptimizerKind::Rms => ModuleOptimizer::Rms(
                RmsPropConfig::new()
                    .with_alpha(config.beta1 as f32)
                    .init::<B, M>(),
            ),
        }
    }

    pub fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        match self {
            ModuleOptimizer::Adam(optim) => optim.step(lr, module, grads),
            ModuleOptimizer::Rms(optim) => optim.step(lr, module, grads),
        }
    }
}

/// Symmetric bound applied to critic weights.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipRange {
    pub low: f64,
    pub high: f64,
}

/// Generator and discriminator update procedures.
///
/// When a clip range is set, the discriminator is clipped as part of every
/// discriminator update, before control returns to the caller.
pub struct GanOptimizer<B: AutodiffBackend> {
    schedule: LrSchedule,
    discriminator_lr_scale: f64,
    generator: ModuleOptimizer<Generator<B>, B>,
    discriminator: ModuleOptimizer<Discriminator<B>, B>,
    clip: Option<ClipRange>,
}

impl<B: AutodiffBackend> GanOptimizer<B> {
    pub fn new(config: &OptimConfig, clip: Option<ClipRange>) -> Self {
        Self {
            schedule: LrSchedule {
                base: config.learning_rate,
                decay_rate: config.lr_decay,
                decay_steps: config.decay_steps,
            },
            discriminator_lr_scale: config.discriminator_lr_scale,
            generator: ModuleOptimizer::new(config),
            discriminator: ModuleOptimizer::new(config),
            clip,
        }
    }

    pub fn generator_lr(&self, step: usize) -> f64 {
        self.schedule.at(step)
    }

    pub fn discriminator_lr(&self, step: usize) -> f64 {
        self.schedule.at(step) * self.discriminator_lr_scale
    }

    pub fn clip(&self) -> Option<ClipRange> {
        self.clip
    }

    /// Minimize `loss` over the generator parameters only.
    pub fn update_generator(
        &mut self,
        step: usize,
        generator: Generator<B>,
        loss: Tensor<B, 1>,
    ) -> Generator<B> {
        let grads = GradientsParams::from_grads(loss.backward(), &generator);
        self.apply_generator(step, generator, grads)
    }

    pub fn apply_generator(
        &mut self,
        step: usize,
        generator: Generator<B>,
        grads: GradientsParams,
    ) -> Generator<B> {
        let lr = self.generator_lr(step);
        self.generator.step(lr, generator, grads)
    }

    /// Minimize `loss` over the discriminator parameters only, then clip.
    pub fn update_discriminator(
        &mut self,
        step: usize,
        discriminator: Discriminator<B>,
        loss: Tensor<B, 1>,
    ) -> Discriminator<B> {
        let grads = GradientsParams::from_grads(loss.backward(), &discriminator);
        self.apply_discriminator(step, discriminator, grads)
    }

    pub fn apply_discriminator(
        &mut self,
        step: usize,
        discriminator: Discriminator<B>,
        grads: GradientsParams,
    ) -> Discriminator<B> {
        let lr = self.discriminator_lr(step);
        let discriminator = self.discriminator.step(lr, discriminator, grads);
        match self.clip {
            Some(range) => clip_weights(discriminator, range),
            None => discriminator,
        }
    }
}

/// Clamp every float parameter of `module` into `range`, in place.
pub fn clip_weights<B: Backend, M: Module<B>>(module: M, range: ClipRange) -> M {
    let mut clipper = WeightClipper { range };
    module.map(&mut clipper)
}

struct WeightClipper {
    range: ClipRange,
}

impl<B: Backend> ModuleMapper<B> for WeightClipper {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let ClipRange { low, high } = self.range;
        param.map(|tensor| {
            let require_grad = tensor.is_require_grad();
            tensor
                .clamp(low, high)
                .detach()
                .set_require_grad(require_grad)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::ModuleVisitor;

    type TestBackend = Autodiff<NdArray<f32>>;

    struct Bounds {
        min: f32,
        max: f32,
        trainable: bool,
    }

    impl<B: Backend> ModuleVisitor<B> for Bounds {
        fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
            let tensor = param.val();
            self.trainable &= tensor.is_require_grad();
            for value in tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap() {
                self.min = self.min.min(value);
                self.max = self.max.max(value);
            }
        }
    }

    fn bounds<M: Module<TestBackend>>(module: &M) -> Bounds {
        let mut bounds = Bounds {
            min: f32::MAX,
            max: f32::MIN,
            trainable: true,
        };
        module.visit(&mut bounds);
        bounds
    }

    fn tiny() -> ModelConfig {
        ModelConfig::new()
            .with_image_size(16)
            .with_discriminator_dim(2)
            .with_generator_dim(2)
            .with_encoder_dim(2)
            .with_feature_dim(8)
    }

    #[test]
    fn learning_rate_is_staircase() {
        let schedule = LrSchedule {
            base: 0.002,
            decay_rate: 0.96,
            decay_steps: 100_000,
        };
        assert_eq!(schedule.at(0), 0.002);
        assert_eq!(schedule.at(99_999), 0.002);
        assert!((schedule.at(100_000) - 0.002 * 0.96).abs() < 1e-15);
        assert!((schedule.at(199_999) - 0.002 * 0.96).abs() < 1e-15);
        assert!((schedule.at(250_000) - 0.002 * 0.96 * 0.96).abs() < 1e-15);
        for step in [1, 5_000, 123_456, 987_654] {
            let expected = 0.002 * 0.96f64.powi((step / 100_000) as i32);
            assert!((schedule.at(step) - expected).abs() < 1e-15);
        }
    }

    #[test]
    fn discriminator_lr_is_a_tenth() {
        let optim = GanOptimizer::<TestBackend>::new(&OptimConfig::new(), None);
        assert!((optim.discriminator_lr(0) - 0.0002).abs() < 1e-12);
        assert!((optim.discriminator_lr(300_000) - optim.generator_lr(300_000) * 0.1).abs() < 1e-15);
    }

    #[test]
    fn optimizer_names_parse() {
        assert_eq!("Adam".parse::<OptimizerKind>(), Ok(OptimizerKind::Adam));
        assert_eq!("RMS".parse::<OptimizerKind>(), Ok(OptimizerKind::Rms));
        assert_eq!(
            "SGD".parse::<OptimizerKind>(),
            Err(ConfigError::UnknownOptimizer("SGD".into()))
        );
    }

    #[test]
    fn clip_bounds_every_parameter_and_keeps_it_trainable() {
        let device = Default::default();
        let discriminator = tiny()
            .init_discriminator::<TestBackend>(&device)
            .map(&mut Scale(100.0));
        let before = bounds(&discriminator);
        assert!(before.max > 0.05 || before.min < -0.05);

        let range = ClipRange {
            low: -0.05,
            high: 0.05,
        };
        let clipped = clip_weights(discriminator, range);
        let after = bounds(&clipped);
        assert!(after.min >= -0.05 && after.max <= 0.05);
        assert!(after.trainable);
    }

    #[test]
    fn discriminator_update_clips_in_wgan_mode() {
        let device = Default::default();
        let range = ClipRange {
            low: -0.01,
            high: 0.01,
        };
        for kind in [OptimizerKind::Adam, OptimizerKind::Rms] {
            let config = OptimConfig::new().with_optimizer(kind).with_learning_rate(0.5);
            let mut optim = GanOptimizer::<TestBackend>::new(&config, Some(range));
            let discriminator = tiny().init_discriminator::<TestBackend>(&device);
            let images = Tensor::<TestBackend, 4>::ones([2, 3, 16, 16], &device);
            let loss = discriminator.forward(images).mean().neg();
            let updated = optim.update_discriminator(0, discriminator, loss);
            let after = bounds(&updated);
            assert!(after.min >= -0.01 && after.max <= 0.01, "{kind}");
        }
    }

    #[test]
    fn generator_update_changes_parameters() {
        let device = Default::default();
        let mut optim = GanOptimizer::<TestBackend>::new(&OptimConfig::new(), None);
        let generator = tiny().init_generator::<TestBackend>(&device);
        let features =
            Tensor::<TestBackend, 2>::random([2, 8], burn::tensor::Distribution::Default, &device);
        let before = generator
            .clone()
            .forward(features.clone())
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let loss = generator.forward(features.clone()).mean();
        let updated = optim.update_generator(0, generator, loss);
        let after = updated.forward(features).into_data().to_vec::<f32>().unwrap();
        assert_ne!(before, after);
    }

    struct Scale(f64);

    impl<B: Backend> ModuleMapper<B> for Scale {
        fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
            let factor = self.0;
            param.map(|tensor| {
                let require_grad = tensor.is_require_grad();
                tensor.mul_scalar(factor).detach().set_require_grad(require_grad)
            })
        }
    }
}
