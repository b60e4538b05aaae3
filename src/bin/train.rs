#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use clap::Parser;
use deepsim_burn::model::{LossConfig, ModelConfig, Objective};
use deepsim_burn::optim::{OptimConfig, OptimizerKind};
use deepsim_burn::training::{Mode, StopSignal, TrainingConfig};
use std::future::Future;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(about = "Train a deepSim generator against a frozen encoder with Burn")]
struct Args {
    /// Device index to run on.
    #[arg(long, default_value = "0")]
    gpu: String,
    #[arg(long, default_value_t = 200000)]
    iters: usize,
    #[arg(long, default_value = "voc_2007_trainval")]
    dataset_name: String,
    /// Directory holding `<dataset_name>.json` manifests.
    #[arg(long, default_value = "data")]
    data_root: String,
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    #[arg(long)]
    logdir: String,
    /// Pretrained encoder weights (file or directory).
    #[arg(long)]
    encoder: String,
    #[arg(long, default_value_t = 123456789)]
    seed: u64,
    #[arg(long, default_value = "Adam")]
    optimizer: OptimizerKind,
    #[arg(long, default_value_t = 0.002)]
    lr: f64,
    #[arg(long, default_value_t = 0.96)]
    lr_decay: f64,
    #[arg(long, default_value_t = 0.5)]
    beta1: f64,
    #[arg(long, default_value_t = 50000)]
    save_freq: usize,
    #[arg(long, default_value_t = 50)]
    show_freq: usize,
    #[arg(long, default_value_t = 100)]
    summ_freq: usize,
    #[arg(long, alias = "clip0", default_value_t = -0.05, allow_negative_numbers = true)]
    clip_low: f64,
    #[arg(long, alias = "clip1", default_value_t = 0.05, allow_negative_numbers = true)]
    clip_high: f64,
    #[arg(long, default_value_t = 5)]
    critic_iters: usize,
    #[arg(long, alias = "gan", default_value = "gan")]
    objective: Objective,
    #[arg(long, default_value = "train")]
    mode: Mode,
    #[arg(long, default_value_t = 64)]
    image_size: usize,
    #[arg(long, default_value_t = 72)]
    load_size: usize,
    #[arg(long, default_value_t = 1.0)]
    recon_weight: f64,
    #[arg(long, default_value_t = 0.01)]
    feat_weight: f64,
    #[arg(long, default_value_t = 0.001)]
    adversarial_weight: f64,
    /// Decode workers; above 1, batch order within a pass is not preserved.
    #[arg(long, default_value_t = 1)]
    prefetch_workers: usize,
    /// Log gradient norms every step.
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn training_config(&self) -> TrainingConfig {
        TrainingConfig::new(
            self.logdir.clone(),
            self.encoder.clone(),
            self.dataset_name.clone(),
            self.data_root.clone(),
        )
        .with_model(ModelConfig::new().with_image_size(self.image_size))
        .with_loss(
            LossConfig::new()
                .with_recon_weight(self.recon_weight)
                .with_feat_weight(self.feat_weight)
                .with_adversarial_weight(self.adversarial_weight),
        )
        .with_optim(
            OptimConfig::new()
                .with_optimizer(self.optimizer)
                .with_learning_rate(self.lr)
                .with_lr_decay(self.lr_decay)
                .with_beta1(self.beta1),
        )
        .with_objective(self.objective)
        .with_mode(self.mode)
        .with_iters(self.iters)
        .with_batch_size(self.batch_size)
        .with_load_size(self.load_size)
        .with_seed(self.seed)
        .with_save_freq(self.save_freq)
        .with_show_freq(self.show_freq)
        .with_summ_freq(self.summ_freq)
        .with_clip_low(self.clip_low)
        .with_clip_high(self.clip_high)
        .with_critic_iters(self.critic_iters)
        .with_prefetch_workers(self.prefetch_workers)
        .with_debug(self.debug)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    let gpu: usize = args
        .gpu
        .parse()
        .with_context(|| format!("invalid --gpu index {}", args.gpu))?;
    let config = args.training_config();
    info!("Called with argument: {:?}", args);

    let stop = StopSignal::new();
    spawn_interrupt_listener(stop.clone())?;

    #[cfg(feature = "cuda")]
    {
        use burn_cuda::{Cuda, CudaDevice};
        let device = CudaDevice::new(gpu);
        return run::<Cuda<f32, i32>>(config, device, &stop);
    }

    #[cfg(not(feature = "cuda"))]
    {
        use burn::backend::wgpu::graphics::AutoGraphicsApi;
        use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
        use burn::backend::WebGpu;

        let mut config = config;
        let device = WgpuDevice::DiscreteGpu(gpu);
        let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
        let max_storage_buffer_binding_size =
            setup.device.limits().max_storage_buffer_binding_size as u64;
        adjust_batch_size_for_wgpu(&mut config, max_storage_buffer_binding_size)?;
        run::<WebGpu<f32, i32>>(config, device, &stop)
    }
}

fn run<B: burn::tensor::backend::Backend>(
    config: TrainingConfig,
    device: B::Device,
    stop: &StopSignal,
) -> Result<()> {
    match config.mode {
        Mode::Train => {
            deepsim_burn::training::train::<Autodiff<B>>(config, device, stop)?;
        }
        Mode::Test => {
            deepsim_burn::training::test::<B>(config, device)?;
        }
    }
    Ok(())
}

/// Raise `stop` on the first Ctrl-C; the loop exits once the current step ends.
/// A second Ctrl-C exits the process immediately.
fn spawn_interrupt_listener(stop: StopSignal) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build signal runtime")?;
    std::thread::Builder::new()
        .name("interrupt".into())
        .spawn(move || {
            runtime.block_on(watch_interrupts(tokio::signal::ctrl_c, stop, || {
                std::process::exit(130)
            }))
        })
        .context("failed to spawn interrupt listener")?;
    Ok(())
}

async fn watch_interrupts<F, Fut>(mut next_signal: F, stop: StopSignal, force_exit: impl FnOnce())
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = next_signal().await {
        warn!("failed to listen for interrupt: {err}");
        return;
    }
    info!("interrupt received, stopping after the current step (Ctrl-C again to exit now)");
    stop.stop();

    if let Err(err) = next_signal().await {
        warn!("failed to listen for interrupt: {err}");
        return;
    }
    warn!("second interrupt received, exiting");
    force_exit();
}

fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes =
        estimate_max_conv_workspace_elems(&config.model).saturating_mul(elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let max_batch = (max_storage_buffer_binding_size.saturating_sub(1) / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce image_size or model dims."
        ));
    }
    if config.batch_size > max_batch {
        warn!(
            "wgpu max storage buffer size {} bytes, estimated conv workspace per sample {} bytes; lowering batch_size from {} to {}",
            max_storage_buffer_binding_size, per_sample_bytes, config.batch_size, max_batch
        );
        config.batch_size = max_batch;
    }
    Ok(())
}

/// Largest im2col/col2im buffer any single conv layer needs for one sample.
fn estimate_max_conv_workspace_elems(model: &ModelConfig) -> u64 {
    let kernel_area = 16u64;
    let mut max_elems = 0u64;

    // The encoder and the discriminator share the strided layout.
    let strided = |dim: usize, strides: &[u64], max_elems: &mut u64| {
        let mut size = model.image_size as u64;
        let mut in_channels = 3u64;
        for (layer, &stride) in strides.iter().enumerate() {
            size = conv_out(size, 4, stride, 1);
            *max_elems = (*max_elems).max(in_channels * size * size * kernel_area);
            in_channels = dim as u64 * (1 << layer);
        }
    };
    strided(model.encoder_dim, &[2, 2, 2, 2], &mut max_elems);
    strided(model.discriminator_dim, &[2, 2, 2, 1], &mut max_elems);

    // Generator upsampling from image_size / 16.
    let mut size = model.image_size as u64 / 16;
    let dim = model.generator_dim as u64;
    for out_channels in [dim * 4, dim * 2, dim, 3] {
        max_elems = max_elems.max(out_channels * size * size * kernel_area);
        size *= 2;
    }

    max_elems
}

fn conv_out(input: u64, kernel: u64, stride: u64, padding: u64) -> u64 {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}
