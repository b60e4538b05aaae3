//! Generator/discriminator snapshots under the log directory.
//!
//! Each checkpoint is a `model-<step>` directory. The `checkpoint` index file
//! names the latest complete one and is only rewritten after the directory
//! has been fully written and moved into place.

use crate::error::CheckpointError;
use crate::model::{Discriminator, Generator, WeightRecorder};
use anyhow::{Context, Result};
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

pub const INDEX_FILE: &str = "checkpoint";
const GENERATOR_FILE: &str = "generator";
const DISCRIMINATOR_FILE: &str = "discriminator";
const STATE_FILE: &str = "state.json";

/// Persisted training state stored next to the weights.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    pub step: usize,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct CheckpointIndex {
    latest: String,
    all: Vec<String>,
}

/// Restored parameters and step counter.
pub struct Restored<B: Backend> {
    pub step: usize,
    pub path: PathBuf,
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
}

/// Writes and reads checkpoints in one directory. Nothing is ever evicted.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Save both parameter groups and the step counter; returns the directory.
    pub fn save<B: Backend>(
        &self,
        step: usize,
        generator: &Generator<B>,
        discriminator: &Discriminator<B>,
    ) -> Result<PathBuf> {
        let name = checkpoint_name(step);
        let final_dir = self.dir.join(&name);
        let partial_dir = self.dir.join(format!("{name}.partial"));
        if partial_dir.exists() {
            std::fs::remove_dir_all(&partial_dir)
                .with_context(|| format!("failed to clear {}", partial_dir.display()))?;
        }
        std::fs::create_dir_all(&partial_dir)
            .with_context(|| format!("failed to create {}", partial_dir.display()))?;

        let recorder = WeightRecorder::new();
        generator
            .clone()
            .save_file(partial_dir.join(GENERATOR_FILE), &recorder)
            .context("failed to save generator")?;
        discriminator
            .clone()
            .save_file(partial_dir.join(DISCRIMINATOR_FILE), &recorder)
            .context("failed to save discriminator")?;
        let state = serde_json::to_string_pretty(&TrainingState { step })?;
        std::fs::write(partial_dir.join(STATE_FILE), state)?;

        if final_dir.exists() {
            std::fs::remove_dir_all(&final_dir)
                .with_context(|| format!("failed to replace {}", final_dir.display()))?;
        }
        std::fs::rename(&partial_dir, &final_dir)
            .with_context(|| format!("failed to move checkpoint to {}", final_dir.display()))?;

        let mut index = self.read_index()?.unwrap_or_default();
        if !index.all.contains(&name) {
            index.all.push(name.clone());
        }
        index.latest = name;
        self.write_index(&index)?;

        Ok(final_dir)
    }

    /// Step and directory of the latest complete checkpoint, if any.
    pub fn latest(&self) -> Result<Option<(usize, PathBuf)>> {
        let Some(index) = self.read_index()? else {
            return Ok(None);
        };
        let dir = self.dir.join(&index.latest);
        let state_path = dir.join(STATE_FILE);
        let contents = std::fs::read_to_string(&state_path)
            .with_context(|| format!("failed to read {}", state_path.display()))?;
        let state: TrainingState = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", state_path.display()))?;
        Ok(Some((state.step, dir)))
    }

    /// All complete checkpoint directories, oldest step first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let pattern = format!("{}/model-*", self.dir.display());
        let mut dirs: Vec<(usize, PathBuf)> = glob::glob(&pattern)?
            .filter_map(Result::ok)
            .filter(|path| path.is_dir())
            .filter_map(|path| {
                let step = path
                    .file_name()?
                    .to_str()?
                    .strip_prefix("model-")?
                    .parse()
                    .ok()?;
                Some((step, path))
            })
            .collect();
        dirs.sort();
        Ok(dirs.into_iter().map(|(_, path)| path).collect())
    }

    /// Load the latest checkpoint into the given modules. `None` means a fresh start.
    pub fn restore<B: Backend>(
        &self,
        generator: Generator<B>,
        discriminator: Discriminator<B>,
        device: &B::Device,
    ) -> Result<Option<Restored<B>>> {
        let Some((step, path)) = self.latest()? else {
            return Ok(None);
        };
        let recorder = WeightRecorder::new();
        let generator_path = path.join(GENERATOR_FILE);
        let generator = generator
            .load_file(generator_path.clone(), &recorder, device)
            .map_err(|source| CheckpointError::Load {
                what: "generator",
                path: generator_path,
                source,
            })?;
        let discriminator_path = path.join(DISCRIMINATOR_FILE);
        let discriminator = discriminator
            .load_file(discriminator_path.clone(), &recorder, device)
            .map_err(|source| CheckpointError::Load {
                what: "discriminator",
                path: discriminator_path,
                source,
            })?;
        info!("restored checkpoint {} at step {}", path.display(), step);
        Ok(Some(Restored {
            step,
            path,
            generator,
            discriminator,
        }))
    }

    /// Like [`Self::restore`], but a missing checkpoint is an error.
    pub fn restore_required<B: Backend>(
        &self,
        generator: Generator<B>,
        discriminator: Discriminator<B>,
        device: &B::Device,
    ) -> Result<Restored<B>> {
        self.restore(generator, discriminator, device)?
            .ok_or_else(|| CheckpointError::NotFound(self.dir.clone()).into())
    }

    fn read_index(&self) -> Result<Option<CheckpointIndex>> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let index = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(index))
    }

    fn write_index(&self, index: &CheckpointIndex) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_string_pretty(index)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to update {}", path.display()))?;
        Ok(())
    }
}

fn checkpoint_name(step: usize) -> String {
    format!("model-{step}")
}
