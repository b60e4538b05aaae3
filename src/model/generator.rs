use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::prelude::*;

/// Configuration for the feature-to-image generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub image_size: usize,
    pub feature_dim: usize,
    pub generator_dim: usize,
    #[config(default = 3)]
    pub output_channels: usize,
}

/// Projects encoder features to a small spatial map and upsamples it four
/// times back to `image_size`.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    fc: Linear<B>,
    fc_bn: BatchNorm<B>,
    dec_convs: Vec<ConvTranspose2d<B>>,
    dec_bns: Vec<BatchNorm<B>>,
    #[module(ignore)]
    base_size: usize,
    #[module(ignore)]
    base_channels: usize,
}

impl GeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let base_size = self.image_size / 16;
        let base_channels = self.generator_dim * 8;
        let fc = LinearConfig::new(self.feature_dim, base_channels * base_size * base_size)
            .init(device);
        let fc_bn = BatchNormConfig::new(base_channels).init(device);

        let dims = [
            base_channels,
            self.generator_dim * 4,
            self.generator_dim * 2,
            self.generator_dim,
            self.output_channels,
        ];
        let dec_convs = dims
            .windows(2)
            .enumerate()
            .map(|(idx, pair)| dec_conv(pair[0], pair[1], idx == dims.len() - 2, device))
            .collect();
        let dec_bns = dims[1..dims.len() - 1]
            .iter()
            .map(|&channels| BatchNormConfig::new(channels).init(device))
            .collect();

        Generator {
            fc,
            fc_bn,
            dec_convs,
            dec_bns,
            base_size,
            base_channels,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Image of shape `[batch, 3, image_size, image_size]` in `[-1, 1]`, BGR.
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 4> {
        let batch = features.dims()[0];
        let x = self.fc.forward(features).reshape([
            batch,
            self.base_channels,
            self.base_size,
            self.base_size,
        ]);
        let mut x = relu(self.fc_bn.forward(x));

        let last = self.dec_convs.len() - 1;
        for (idx, conv) in self.dec_convs.iter().enumerate() {
            x = conv.forward(x);
            if idx != last {
                x = relu(self.dec_bns[idx].forward(x));
            }
        }
        x.tanh()
    }
}

fn dec_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_bias(bias)
        .init(device)
}
