use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::prelude::*;

/// Configuration for the frozen feature encoder.
#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub image_size: usize,
    pub encoder_dim: usize,
    pub feature_dim: usize,
}

/// Strided conv stack mapping mean-subtracted BGR images to a feature vector.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    convs: Vec<Conv2d<B>>,
    fc: Linear<B>,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let dims = [
            3,
            self.encoder_dim,
            self.encoder_dim * 2,
            self.encoder_dim * 4,
            self.encoder_dim * 8,
        ];
        let convs = dims
            .windows(2)
            .map(|pair| {
                Conv2dConfig::new([pair[0], pair[1]], [4, 4])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();

        let size = self.image_size / 16;
        let fc = LinearConfig::new(size * size * self.encoder_dim * 8, self.feature_dim).init(device);

        Encoder { convs, fc }
    }
}

impl<B: Backend> Encoder<B> {
    /// Features of shape `[batch, feature_dim]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.convs {
            x = relu(conv.forward(x));
        }
        let [batch, channels, height, width] = x.dims();
        relu(self.fc.forward(x.reshape([batch, channels * height * width])))
    }
}
