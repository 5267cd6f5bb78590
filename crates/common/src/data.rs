//! Data pipeline inputs: raw image batches and the sources that produce them.
//!
//! A source yields [`RawBatch`]es of decoded `(H, W, C)` f32 pixel tensors with
//! 0-indexed labels. Augmentation happens downstream.
//!
//! * **[`ImageFolderDataset`]** — class shards on disk, decoded with `image`.
//! * **[`TensorDataset`]** — images already in memory (synthetic runs, tests).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Which of the two code paths a batch is headed for.
///
/// Selects crop count in augmentation, dropout vs. output scaling in the
/// model, and batch vs. running statistics in normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Eval => "eval",
        }
    }
}

// ── RawBatch ────────────────────────────────────────────────────────────────

/// Decoded images and their labels, straight from the reader.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub images: Vec<Tensor>,
    pub labels: Vec<u32>,
}

impl RawBatch {
    pub fn new(images: Vec<Tensor>, labels: Vec<u32>) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(Error::LabelCountMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// ── RecordSource trait ──────────────────────────────────────────────────────

/// Common interface for anything that yields raw labelled image batches.
pub trait RecordSource {
    /// Number of samples per pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One pass over the data in batches of `batch_size`. The final batch may
    /// be short. `shuffle_seed = None` keeps the stored order.
    fn raw_batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Box<dyn Iterator<Item = AnyhowResult<RawBatch>> + '_>;

    /// Number of batches [`raw_batches`](Self::raw_batches) will yield.
    fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len().div_ceil(batch_size)
        }
    }
}

/// Visit order for one pass: identity, or a seeded permutation.
fn pass_order(len: usize, shuffle_seed: Option<u64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if let Some(seed) = shuffle_seed {
        order.shuffle(&mut StdRng::seed_from_u64(seed));
    }
    order
}

// ── ImageFolderDataset ──────────────────────────────────────────────────────

/// Image corpus laid out as `<root>/<class_id>/*.{jpg,jpeg,png}`.
///
/// Class directories carry 1-indexed class ids; labels are shifted to
/// 0-indexed here. Images are decoded to RGB on demand, in parallel per batch.
pub struct ImageFolderDataset {
    root: PathBuf,
    entries: Vec<(PathBuf, u32)>,
    image_size: Option<u32>,
}

impl ImageFolderDataset {
    /// Index every image below `root`. `image_size` resizes decoded images to
    /// a square of that side.
    pub fn open(root: &Path, image_size: Option<u32>) -> Result<Self> {
        let mut shards: Vec<PathBuf> = std::fs::read_dir(root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        shards.sort();

        let mut entries = Vec::new();
        for shard in shards {
            let label = parse_class_dir(&shard)?;
            let mut files: Vec<PathBuf> = std::fs::read_dir(&shard)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_image_file(p))
                .collect();
            files.sort();
            entries.extend(files.into_iter().map(|p| (p, label)));
        }

        tracing::info!(
            root = %root.display(),
            images = entries.len(),
            "indexed image folder"
        );
        Ok(Self {
            root: root.to_path_buf(),
            entries,
            image_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of distinct labels present.
    pub fn num_classes(&self) -> usize {
        let mut labels: Vec<u32> = self.entries.iter().map(|(_, l)| *l).collect();
        labels.sort_unstable();
        labels.dedup();
        labels.len()
    }

    fn decode_batch(&self, idxs: &[usize]) -> AnyhowResult<RawBatch> {
        let images = idxs
            .par_iter()
            .map(|&i| {
                let (path, _) = &self.entries[i];
                decode_image(path, self.image_size)
                    .with_context(|| format!("decode {}", path.display()))
            })
            .collect::<AnyhowResult<Vec<_>>>()?;
        let labels = idxs.iter().map(|&i| self.entries[i].1).collect();
        Ok(RawBatch::new(images, labels)?)
    }

    /// Per-channel mean pixel value over the whole corpus.
    ///
    /// Offline tool: the result is meant to be pasted into the training
    /// config, not recomputed per run.
    pub fn channel_mean(&self) -> AnyhowResult<Vec<f64>> {
        let (sum, count) = self
            .entries
            .par_iter()
            .map(|(path, _)| -> AnyhowResult<([f64; 3], f64)> {
                let img = decode_image(path, self.image_size)
                    .with_context(|| format!("decode {}", path.display()))?;
                let (h, w, _) = img.dims3()?;
                let sums = img
                    .to_dtype(DType::F64)?
                    .sum(0)?
                    .sum(0)?
                    .to_vec1::<f64>()?;
                Ok(([sums[0], sums[1], sums[2]], (h * w) as f64))
            })
            .try_reduce(
                || ([0.0; 3], 0.0),
                |a, b| {
                    Ok((
                        [a.0[0] + b.0[0], a.0[1] + b.0[1], a.0[2] + b.0[2]],
                        a.1 + b.1,
                    ))
                },
            )?;
        if count == 0.0 {
            anyhow::bail!("no images under {}", self.root.display());
        }
        Ok(sum.iter().map(|s| s / count).collect())
    }
}

impl RecordSource for ImageFolderDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn raw_batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Box<dyn Iterator<Item = AnyhowResult<RawBatch>> + '_> {
        let order = pass_order(self.entries.len(), shuffle_seed);
        let mut start = 0usize;
        Box::new(std::iter::from_fn(move || {
            if batch_size == 0 || start >= order.len() {
                return None;
            }
            let end = (start + batch_size).min(order.len());
            let batch = self.decode_batch(&order[start..end]);
            start = end;
            Some(batch)
        }))
    }
}

// ── TensorDataset (in-memory) ───────────────────────────────────────────────

/// Images already decoded into `(H, W, C)` tensors.
pub struct TensorDataset {
    images: Vec<Tensor>,
    labels: Vec<u32>,
}

impl TensorDataset {
    pub fn new(images: Vec<Tensor>, labels: Vec<u32>) -> Result<Self> {
        let RawBatch { images, labels } = RawBatch::new(images, labels)?;
        Ok(Self { images, labels })
    }

    /// Uniform-noise images in `[0, 255)` with labels cycling over
    /// `num_classes`.
    pub fn synthetic(
        len: usize,
        size: usize,
        num_classes: usize,
        device: &Device,
    ) -> Result<Self> {
        let mut images = Vec::with_capacity(len);
        for _ in 0..len {
            images.push(Tensor::rand(0f32, 255f32, (size, size, 3), device)?);
        }
        let labels = (0..len).map(|i| (i % num_classes.max(1)) as u32).collect();
        Self::new(images, labels)
    }
}

impl RecordSource for TensorDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn raw_batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Box<dyn Iterator<Item = AnyhowResult<RawBatch>> + '_> {
        let order = pass_order(self.labels.len(), shuffle_seed);
        let chunk = batch_size.max(1);
        let batches: Vec<Vec<usize>> = if batch_size == 0 {
            Vec::new()
        } else {
            order.chunks(chunk).map(|c| c.to_vec()).collect()
        };
        Box::new(batches.into_iter().map(move |idxs| {
            let images = idxs.iter().map(|&i| self.images[i].clone()).collect();
            let labels = idxs.iter().map(|&i| self.labels[i]).collect();
            Ok(RawBatch::new(images, labels)?)
        }))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Decode one image file to an `(H, W, 3)` f32 tensor on the CPU.
pub fn decode_image(path: &Path, image_size: Option<u32>) -> Result<Tensor> {
    let mut rgb = image::open(path)?.to_rgb8();
    if let Some(side) = image_size {
        if rgb.width() != side || rgb.height() != side {
            rgb = image::imageops::resize(&rgb, side, side, FilterType::Triangle);
        }
    }
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let tensor = Tensor::from_vec(rgb.into_raw(), (h, w, 3), &Device::Cpu)?;
    Ok(tensor.to_dtype(DType::F32)?)
}

/// Class directory name → 0-indexed label (`"1"` → 0).
fn parse_class_dir(dir: &Path) -> Result<u32> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match name.parse::<u32>() {
        Ok(id) if id >= 1 => Ok(id - 1),
        _ => Err(Error::InvalidLabel(name)),
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let e = e.to_string_lossy().to_ascii_lowercase();
            e == "jpg" || e == "jpeg" || e == "png"
        })
        .unwrap_or(false)
}

// ── Tests ───────────────────────────────────────────────────────────────────
