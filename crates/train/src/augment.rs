//! Multi-crop augmentation: raw images → mean-centred `crop × crop` variants.
//!
//! * Train: 2 variants per image — a random crop of the image and a random
//!   crop of its horizontal mirror.
//! * Eval: 10 variants per image — top-left, top-right, bottom-left,
//!   bottom-right and centre crops of the image, then the same five of the
//!   mirror.
//!
//! Variants of one image are contiguous in the output and carry its label.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use alexnet_common::{Error, Mode, RawBatch, Result, IMAGENET_MEAN};

/// Crops per image for each mode.
pub fn variants_per_image(mode: Mode) -> usize {
    match mode {
        Mode::Train => 2,
        Mode::Eval => 10,
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// Output of one augmentation run: `(V·N, crop, crop, C)` images.
#[derive(Debug, Clone)]
pub struct AugmentedBatch {
    pub images: Tensor,
    pub labels: Vec<u32>,
}

/// A fixed-size slice of a reshuffled [`AugmentedBatch`].
#[derive(Debug, Clone)]
pub struct MiniBatch {
    pub images: Tensor,
    pub labels: Vec<u32>,
}

impl AugmentedBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Shuffle and cut into `batch_size` mini-batches; the remainder that does
    /// not fill a whole mini-batch is dropped.
    pub fn into_mini_batches<R: Rng + ?Sized>(
        self,
        batch_size: usize,
        rng: &mut R,
    ) -> candle_core::Result<Vec<MiniBatch>> {
        let n = self.len();
        if batch_size == 0 || n < batch_size {
            return Ok(Vec::new());
        }
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.shuffle(rng);

        let labels: Vec<u32> = order.iter().map(|&i| self.labels[i as usize]).collect();
        let idx = Tensor::from_vec(order, n, self.images.device())?;
        let images = self.images.index_select(&idx, 0)?;

        (0..n / batch_size)
            .map(|b| {
                let start = b * batch_size;
                Ok(MiniBatch {
                    images: images.narrow(0, start, batch_size)?,
                    labels: labels[start..start + batch_size].to_vec(),
                })
            })
            .collect()
    }
}

// ── Worker trait ────────────────────────────────────────────────────────────

/// Anything that turns a raw batch into an augmented one. Runs on the
/// pipeline's background thread, hence `Send`.
pub trait AugmentWorker: Send {
    fn augment(&mut self, raw: RawBatch, mode: Mode) -> Result<AugmentedBatch>;
}

// ── Augmenter ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Crop {
    top: usize,
    left: usize,
}

pub struct Augmenter {
    crop: usize,
    mean: Tensor,
    channels: usize,
    rng: StdRng,
}

impl Augmenter {
    /// `mean` is the fixed per-channel mean subtracted from every crop.
    pub fn new(crop: usize, mean: &[f32], seed: u64) -> Result<Self> {
        if crop == 0 {
            return Err(Error::invalid_config("crop size must be > 0"));
        }
        if mean.is_empty() {
            return Err(Error::invalid_config("mean vector must not be empty"));
        }
        Ok(Self {
            crop,
            mean: Tensor::from_slice(mean, mean.len(), &Device::Cpu)?,
            channels: mean.len(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// ImageNet mean, the usual setup.
    pub fn imagenet(crop: usize, seed: u64) -> Result<Self> {
        Self::new(crop, &IMAGENET_MEAN, seed)
    }

    pub fn crop_size(&self) -> usize {
        self.crop
    }

    /// The five fixed eval crop positions for an `h × w` image.
    fn fixed_crops(&self, h: usize, w: usize) -> [Crop; 5] {
        let (bottom, right) = (h - self.crop, w - self.crop);
        [
            Crop { top: 0, left: 0 },
            Crop { top: 0, left: right },
            Crop { top: bottom, left: 0 },
            Crop {
                top: bottom,
                left: right,
            },
            Crop {
                top: bottom.div_ceil(2),
                left: right.div_ceil(2),
            },
        ]
    }

    fn random_crop(&mut self, h: usize, w: usize) -> Crop {
        Crop {
            top: self.rng.gen_range(0..=h - self.crop),
            left: self.rng.gen_range(0..=w - self.crop),
        }
    }

    fn cut(&self, image: &Tensor, at: Crop) -> candle_core::Result<Tensor> {
        image
            .narrow(0, at.top, self.crop)?
            .narrow(1, at.left, self.crop)?
            .broadcast_sub(&self.mean)
    }

    /// Validate and convert one image to f32 on the CPU; returns `(h, w)`.
    fn prepare(&self, image: &Tensor) -> Result<(Tensor, usize, usize)> {
        let (h, w, c) = image.dims3()?;
        if c != self.channels {
            return Err(Error::ChannelMismatch {
                expected: self.channels,
                found: c,
            });
        }
        if h < self.crop || w < self.crop {
            return Err(Error::ImageTooSmall {
                height: h,
                width: w,
                crop: self.crop,
            });
        }
        let image = image.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        Ok((image, h, w))
    }

    fn variants(&mut self, image: &Tensor, mode: Mode) -> Result<Vec<Tensor>> {
        let (image, h, w) = self.prepare(image)?;
        let mirror = flip_horizontal(&image)?;
        let out = match mode {
            Mode::Train => {
                let a = self.random_crop(h, w);
                let b = self.random_crop(h, w);
                vec![self.cut(&image, a)?, self.cut(&mirror, b)?]
            }
            Mode::Eval => {
                let crops = self.fixed_crops(h, w);
                let mut out = Vec::with_capacity(10);
                for src in [&image, &mirror] {
                    for at in crops {
                        out.push(self.cut(src, at)?);
                    }
                }
                out
            }
        };
        Ok(out)
    }
}

impl AugmentWorker for Augmenter {
    fn augment(&mut self, raw: RawBatch, mode: Mode) -> Result<AugmentedBatch> {
        if raw.images.len() != raw.labels.len() {
            return Err(Error::LabelCountMismatch {
                images: raw.images.len(),
                labels: raw.labels.len(),
            });
        }
        let per_image = variants_per_image(mode);
        let mut images = Vec::with_capacity(raw.len() * per_image);
        let mut labels = Vec::with_capacity(raw.len() * per_image);
        for (image, &label) in raw.images.iter().zip(&raw.labels) {
            images.extend(self.variants(image, mode)?);
            labels.extend(std::iter::repeat(label).take(per_image));
        }

        let images = if images.is_empty() {
            Tensor::zeros((0, self.crop, self.crop, self.channels), DType::F32, &Device::Cpu)?
        } else {
            Tensor::stack(&images, 0)?
        };
        Ok(AugmentedBatch { images, labels })
    }
}

/// Mirror an `(H, W, C)` image left ↔ right.
pub fn flip_horizontal(image: &Tensor) -> candle_core::Result<Tensor> {
    let w = image.dim(1)?;
    let rev: Vec<u32> = (0..w as u32).rev().collect();
    let idx = Tensor::from_vec(rev, w, image.device())?;
    image.index_select(&idx, 1)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// `(h, w, 3)` image whose pixel value encodes its position: `100·y + x`
    /// in every channel.
    fn coord_image(h: usize, w: usize) -> Tensor {
        let data: Vec<f32> = (0..h)
            .flat_map(|y| (0..w).flat_map(move |x| [(100 * y + x) as f32; 3]))
            .collect();
        Tensor::from_vec(data, (h, w, 3), &Device::Cpu).unwrap()
    }

    fn raw(n: usize, h: usize, w: usize) -> RawBatch {
        let images = (0..n).map(|_| coord_image(h, w)).collect();
        let labels = (0..n as u32).map(|i| 10 + i).collect();
        RawBatch::new(images, labels).unwrap()
    }

    fn pixel(t: &Tensor, i: usize, y: usize, x: usize) -> f32 {
        t.get(i)
            .unwrap()
            .get(y)
            .unwrap()
            .get(x)
            .unwrap()
            .get(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn train_mode_doubles_and_pairs_labels() {
        let mut aug = Augmenter::new(4, &[0.0, 0.0, 0.0], 1).unwrap();
        let out = aug.augment(raw(3, 6, 7), Mode::Train).unwrap();
        assert_eq!(out.images.dims(), &[6, 4, 4, 3]);
        assert_eq!(out.labels.len(), 6);
        for i in 0..3 {
            assert_eq!(out.labels[2 * i], 10 + i as u32);
            assert_eq!(out.labels[2 * i + 1], 10 + i as u32);
        }
    }

    #[test]
    fn eval_mode_ten_crops_in_blocks() {
        let mut aug = Augmenter::new(4, &[0.0, 0.0, 0.0], 1).unwrap();
        let out = aug.augment(raw(2, 6, 7), Mode::Eval).unwrap();
        assert_eq!(out.images.dims(), &[20, 4, 4, 3]);
        assert_eq!(&out.labels[..10], &[10; 10]);
        assert_eq!(&out.labels[10..], &[11; 10]);
    }

    #[test]
    fn eval_crop_positions() {
        let mut aug = Augmenter::new(4, &[0.0, 0.0, 0.0], 1).unwrap();
        // h = 6, w = 7 → bottom = 2, right = 3, centre = (1, 2)
        let out = aug.augment(raw(1, 6, 7), Mode::Eval).unwrap();
        let imgs = &out.images;
        assert_eq!(pixel(imgs, 0, 0, 0), 0.0); // top-left
        assert_eq!(pixel(imgs, 1, 0, 0), 3.0); // top-right
        assert_eq!(pixel(imgs, 2, 0, 0), 200.0); // bottom-left
        assert_eq!(pixel(imgs, 3, 0, 0), 203.0); // bottom-right
        assert_eq!(pixel(imgs, 4, 0, 0), 102.0); // centre
        // Mirror: column x of the mirror is column 6 - x of the original.
        assert_eq!(pixel(imgs, 5, 0, 0), 6.0);
        assert_eq!(pixel(imgs, 6, 0, 0), 3.0);
        assert_eq!(pixel(imgs, 9, 0, 0), 104.0);
    }

    #[test]
    fn mean_is_subtracted_per_channel() {
        let mut aug = Augmenter::new(2, &[1.0, 2.0, 3.0], 1).unwrap();
        let img = Tensor::full(10f32, (2, 2, 3), &Device::Cpu).unwrap();
        let out = aug
            .augment(RawBatch::new(vec![img], vec![0]).unwrap(), Mode::Eval)
            .unwrap();
        let px = out.images.get(0).unwrap().get(0).unwrap().get(0).unwrap();
        assert_eq!(px.to_vec1::<f32>().unwrap(), vec![9.0, 8.0, 7.0]);
    }

    #[test]
    fn random_crops_stay_in_bounds() {
        let mut aug = Augmenter::new(3, &[0.0, 0.0, 0.0], 42).unwrap();
        for _ in 0..50 {
            let at = aug.random_crop(5, 8);
            assert!(at.top <= 2 && at.left <= 5);
        }
    }

    #[test]
    fn same_seed_same_crops() {
        let mut a = Augmenter::new(4, &[0.0, 0.0, 0.0], 9).unwrap();
        let mut b = Augmenter::new(4, &[0.0, 0.0, 0.0], 9).unwrap();
        let x = a.augment(raw(2, 9, 9), Mode::Train).unwrap();
        let y = b.augment(raw(2, 9, 9), Mode::Train).unwrap();
        let x = x.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let y = y.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn too_small_is_an_error() {
        let mut aug = Augmenter::new(8, &[0.0, 0.0, 0.0], 1).unwrap();
        for mode in [Mode::Train, Mode::Eval] {
            let err = aug.augment(raw(1, 8, 7), mode).unwrap_err();
            assert!(matches!(
                err,
                Error::ImageTooSmall {
                    height: 8,
                    width: 7,
                    crop: 8
                }
            ));
        }
    }

    #[test]
    fn channel_mismatch_is_an_error() {
        let mut aug = Augmenter::new(2, &[0.0, 0.0, 0.0], 1).unwrap();
        let img = Tensor::zeros((4, 4, 1), DType::F32, &Device::Cpu).unwrap();
        let err = aug
            .augment(RawBatch::new(vec![img], vec![0]).unwrap(), Mode::Train)
            .unwrap_err();
        assert!(matches!(err, Error::ChannelMismatch { expected: 3, found: 1 }));
    }

    #[test]
    fn empty_batch_gives_empty_output() {
        let mut aug = Augmenter::new(4, &[0.0, 0.0, 0.0], 1).unwrap();
        let out = aug
            .augment(RawBatch::new(vec![], vec![]).unwrap(), Mode::Train)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(out.images.dims(), &[0, 4, 4, 3]);
    }

    #[test]
    fn mini_batches_drop_remainder_and_keep_pairs() {
        let mut aug = Augmenter::new(4, &[0.0, 0.0, 0.0], 1).unwrap();
        let out = aug.augment(raw(5, 6, 6), Mode::Train).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let minis = out.into_mini_batches(4, &mut rng).unwrap();
        // 10 samples → 2 × 4, 2 dropped
        assert_eq!(minis.len(), 2);
        let mut seen: Vec<u32> = minis.iter().flat_map(|m| m.labels.clone()).collect();
        assert_eq!(seen.len(), 8);
        seen.sort_unstable();
        for w in seen.windows(3) {
            assert!(!(w[0] == w[1] && w[1] == w[2]), "label used 3 times");
        }
        for m in &minis {
            assert_eq!(m.images.dims(), &[4, 4, 4, 3]);
        }
    }

    #[test]
    fn short_batch_yields_no_mini_batches() {
        let mut aug = Augmenter::new(4, &[0.0, 0.0, 0.0], 1).unwrap();
        let out = aug.augment(raw(1, 6, 6), Mode::Train).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(out.into_mini_batches(4, &mut rng).unwrap().is_empty());
    }
}
