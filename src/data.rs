use crate::error::DataError;
use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One manifest line: an image and the classes it contains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub classes: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    num_classes: usize,
    images: Vec<ManifestEntry>,
}

/// Image database backed by a JSON manifest.
#[derive(Debug, Clone)]
pub struct ManifestDatabase {
    num_classes: usize,
    entries: Vec<ManifestEntry>,
}

impl ManifestDatabase {
    pub fn new(num_classes: usize, entries: Vec<ManifestEntry>) -> Result<Self, DataError> {
        for entry in &entries {
            if let Some(&class) = entry.classes.iter().find(|&&c| c >= num_classes) {
                return Err(DataError::ClassOutOfRange {
                    class,
                    num_classes,
                    path: entry.path.clone(),
                });
            }
        }
        Ok(Self {
            num_classes,
            entries,
        })
    }

    /// Load `<data_root>/<name>.json`.
    pub fn open(data_root: &Path, name: &str) -> Result<Self> {
        Self::load(&data_root.join(format!("{name}.json")))
    }

    /// Load a manifest; relative image paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let entries = manifest
            .images
            .into_iter()
            .map(|mut entry| {
                if entry.path.is_relative() {
                    entry.path = base.join(&entry.path);
                }
                entry
            })
            .collect();
        Ok(Self::new(manifest.num_classes, entries)?)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl Dataset<ManifestEntry> for ManifestDatabase {
    fn get(&self, index: usize) -> Option<ManifestEntry> {
        self.entries.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Settings for decoding and cropping images.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Side of the square crop fed to the networks.
    pub image_size: u32,
    /// Side images are resized to before cropping.
    pub load_size: u32,
}

/// A single decoded image.
#[derive(Debug, Clone)]
pub struct Example {
    pub path: PathBuf,
    /// CHW, BGR plane order, values in `[0, 255]`.
    pub image: Vec<f32>,
    /// Multi-hot class indicator.
    pub classes: Vec<f32>,
    /// Source image metadata `[width, channels, scale]`. Not consumed by training.
    pub im_info: [f32; 3],
}

/// Device-side batch.
#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// BCHW BGR in `[0, 255]`.
    pub images: Tensor<B, 4>,
    /// `[batch, num_classes]` multi-hot indicators.
    pub classes: Tensor<B, 2>,
}

/// Stacks decoded examples into an [`ImageBatch`].
#[derive(Debug, Clone)]
pub struct ExampleBatcher {
    image_size: usize,
    num_classes: usize,
}

impl ExampleBatcher {
    pub fn new(config: &DataConfig, num_classes: usize) -> Self {
        Self {
            image_size: config.image_size as usize,
            num_classes,
        }
    }
}

impl<B: Backend> Batcher<B, Example, ImageBatch<B>> for ExampleBatcher {
    fn batch(&self, items: Vec<Example>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let mut images = Vec::with_capacity(batch_size * 3 * self.image_size * self.image_size);
        let mut classes = Vec::with_capacity(batch_size * self.num_classes);
        for example in items {
            images.extend(example.image);
            classes.extend(example.classes);
        }
        ImageBatch {
            images: Tensor::from_data(
                TensorData::new(images, [batch_size, 3, self.image_size, self.image_size]),
                device,
            ),
            classes: Tensor::from_data(
                TensorData::new(classes, [batch_size, self.num_classes]),
                device,
            ),
        }
    }
}

/// Anything the training loop can pull decoded batches from.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Vec<Example>>;

    /// Batcher matching the examples this source yields.
    fn batcher(&self) -> ExampleBatcher;
}

/// Serves images in shuffled passes over the database.
///
/// Each pass visits every index exactly once; a fresh permutation is drawn
/// when the cursor reaches the end. Single consumer.
pub struct DataSupplier {
    database: Arc<ManifestDatabase>,
    config: DataConfig,
    batch_size: usize,
    perm: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl DataSupplier {
    pub fn new(
        database: Arc<ManifestDatabase>,
        config: DataConfig,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, DataError> {
        if database.is_empty() {
            return Err(DataError::EmptyDataset);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut perm: Vec<usize> = (0..database.len()).collect();
        perm.shuffle(&mut rng);
        Ok(Self {
            database,
            config,
            batch_size,
            perm,
            cursor: 0,
            rng,
        })
    }

    pub fn database(&self) -> &Arc<ManifestDatabase> {
        &self.database
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Next dataset index, reshuffling once the current pass is exhausted.
    pub fn next_index(&mut self) -> usize {
        if self.cursor >= self.perm.len() {
            self.cursor = 0;
            self.perm.shuffle(&mut self.rng);
        }
        let index = self.perm[self.cursor];
        self.cursor += 1;
        index
    }

    pub fn next_indices(&mut self, count: usize) -> Vec<usize> {
        (0..count).map(|_| self.next_index()).collect()
    }

    /// Independent generator for a background worker.
    pub(crate) fn fork_rng(&mut self) -> StdRng {
        StdRng::seed_from_u64(self.rng.gen())
    }
}

impl BatchSource for DataSupplier {
    fn next_batch(&mut self) -> Result<Vec<Example>> {
        let indices = self.next_indices(self.batch_size);
        load_examples(self.database.as_ref(), &indices, &self.config, &mut self.rng)
    }

    fn batcher(&self) -> ExampleBatcher {
        ExampleBatcher::new(&self.config, self.database.num_classes())
    }
}

/// Decode the entries at `indices`.
pub fn load_examples(
    database: &ManifestDatabase,
    indices: &[usize],
    config: &DataConfig,
    rng: &mut impl Rng,
) -> Result<Vec<Example>> {
    indices
        .iter()
        .map(|&index| {
            let entry = database.get(index).ok_or(DataError::MissingEntry(index))?;
            load_example(&entry, database.num_classes(), config, rng)
        })
        .collect()
}

/// Decode one image, resize it to `load_size` and take a random crop.
pub fn load_example(
    entry: &ManifestEntry,
    num_classes: usize,
    config: &DataConfig,
    rng: &mut impl Rng,
) -> Result<Example> {
    let path = &entry.path;
    let img = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8();
    let im_info = [img.width() as f32, 3.0, 1.0];

    let resized = image::imageops::resize(
        &img,
        config.load_size,
        config.load_size,
        image::imageops::FilterType::Triangle,
    );
    let cropped = random_crop(&resized, config.image_size, rng);

    Ok(Example {
        path: path.clone(),
        image: image_to_chw_bgr(&cropped),
        classes: class_indicator(&entry.classes, num_classes),
        im_info,
    })
}

fn random_crop(img: &RgbImage, size: u32, rng: &mut impl Rng) -> RgbImage {
    let max_x = img.width().saturating_sub(size);
    let max_y = img.height().saturating_sub(size);
    let x = if max_x == 0 { 0 } else { rng.gen_range(0..=max_x) };
    let y = if max_y == 0 { 0 } else { rng.gen_range(0..=max_y) };
    image::imageops::crop_imm(img, x, y, size, size).to_image()
}

/// Multi-hot indicator over `num_classes`.
pub fn class_indicator(classes: &[usize], num_classes: usize) -> Vec<f32> {
    let mut indicator = vec![0.0; num_classes];
    for &class in classes {
        indicator[class] = 1.0;
    }
    indicator
}

/// Convert RGB image data to CHW floats in BGR plane order, range `[0, 255]`.
fn image_to_chw_bgr(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for y in 0..height {
        for x in 0..width {
            let pixel = img.get_pixel(x, y).0;
            let idx = (y * width + x) as usize;
            out[idx] = pixel[2] as f32;
            out[hw + idx] = pixel[1] as f32;
            out[2 * hw + idx] = pixel[0] as f32;
        }
    }

    out
}
