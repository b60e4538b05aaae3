use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::leaky_relu;
use burn::prelude::*;

/// Configuration for the image critic.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub discriminator_dim: usize,
    pub image_size: usize,
    #[config(default = 3)]
    pub input_channels: usize,
}

/// Conv critic with a single unbounded score head.
///
/// No normalization layers, so weight clipping covers every parameter.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    fc_adv: Linear<B>,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let convs = vec![
            conv(self.input_channels, self.discriminator_dim, device, 2),
            conv(self.discriminator_dim, self.discriminator_dim * 2, device, 2),
            conv(self.discriminator_dim * 2, self.discriminator_dim * 4, device, 2),
            conv(self.discriminator_dim * 4, self.discriminator_dim * 8, device, 1),
        ];

        let mut size = self.image_size;
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 1, 1);
        let flat_dim = size * size * self.discriminator_dim * 8;

        let fc_adv = LinearConfig::new(flat_dim, 1).init(device);

        Discriminator { convs, fc_adv }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Raw scores (logits), shape `[batch, 1]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.convs {
            x = leaky_relu(conv.forward(x), 0.2);
        }

        let [batch, channels, height, width] = x.dims();
        let flat = x.reshape([batch, channels * height * width]);
        self.fc_adv.forward(flat)
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
    stride: usize,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}
