//! Image sources: the CIFAR-10 binary distribution and in-memory sets.

use std::fs;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::tensor::Precision;

/// Per-channel statistics used to standardise every split.
pub const CIFAR10_MEAN: [Precision; 3] = [0.4914, 0.4822, 0.4465];
pub const CIFAR10_STD: [Precision; 3] = [0.2023, 0.1994, 0.2010];

pub const CIFAR10_CLASSES: usize = 10;
const SIDE: usize = 32;
const PIXELS: usize = SIDE * SIDE;
const RECORD_LEN: usize = 1 + 3 * PIXELS;

/// Indexed collection of labelled `(C, H, W)` images.
pub trait Dataset: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(channels, height, width)` of every preprocessed sample.
    fn image_shape(&self) -> [usize; 3];

    /// Writes sample `index` into `output` (one image, `C·H·W` values,
    /// mirrored left to right when `flip` is set) and returns its label.
    fn load_into(&self, index: usize, output: &mut [Precision], flip: bool) -> Result<usize>;

    fn get(&self, index: usize) -> Result<(Vec<Precision>, usize)> {
        let [c, h, w] = self.image_shape();
        let mut image = vec![0.0; c * h * w];
        let label = self.load_into(index, &mut image, false)?;
        Ok((image, label))
    }
}

fn out_of_range(index: usize, len: usize) -> Error {
    Error::Dataset(format!("sample {index} out of range for {len} samples"))
}

fn check_output(output: &[Precision], shape: [usize; 3]) -> Result<()> {
    let expected = shape.iter().product::<usize>();
    if output.len() != expected {
        return Err(Error::ShapeMismatch {
            stage: "dataset".into(),
            expected: format!("{expected} values per image"),
            actual: vec![output.len()],
        });
    }
    Ok(())
}

/// CIFAR-10 records kept as raw bytes and preprocessed when a batch asks for
/// them: bilinear resize from 32×32, scaling to `[0, 1]` and per-channel
/// standardisation.
pub struct Cifar10 {
    records: Vec<u8>,
    image_size: usize,
}

impl Cifar10 {
    pub const TRAIN_FILES: [&'static str; 5] = [
        "data_batch_1.bin",
        "data_batch_2.bin",
        "data_batch_3.bin",
        "data_batch_4.bin",
        "data_batch_5.bin",
    ];
    pub const TEST_FILE: &'static str = "test_batch.bin";

    pub fn load_train(dir: impl AsRef<Path>, image_size: usize) -> Result<Self> {
        Self::from_files(dir.as_ref(), &Self::TRAIN_FILES, image_size)
    }

    pub fn load_test(dir: impl AsRef<Path>, image_size: usize) -> Result<Self> {
        Self::from_files(dir.as_ref(), &[Self::TEST_FILE], image_size)
    }

    fn from_files(dir: &Path, files: &[&str], image_size: usize) -> Result<Self> {
        let mut records = Vec::new();
        for file in files {
            let path = dir.join(file);
            let bytes = fs::read(&path)
                .map_err(|e| Error::Dataset(format!("cannot read {}: {e}", path.display())))?;
            records.extend_from_slice(&bytes);
        }
        let dataset = Self::from_bytes(records, image_size)?;
        info!(dir = %dir.display(), samples = dataset.len(), "loaded CIFAR-10 records");
        Ok(dataset)
    }

    /// Wraps the concatenated contents of one or more batch files.
    pub fn from_bytes(records: Vec<u8>, image_size: usize) -> Result<Self> {
        if records.len() % RECORD_LEN != 0 {
            return Err(Error::Dataset(format!(
                "{} bytes is not a whole number of {RECORD_LEN}-byte records",
                records.len()
            )));
        }
        if image_size == 0 {
            return Err(Error::Config("image_size must be positive".into()));
        }
        for (index, record) in records.chunks(RECORD_LEN).enumerate() {
            if record[0] as usize >= CIFAR10_CLASSES {
                warn!(index, label = record[0], "label outside the 10 CIFAR-10 classes");
            }
        }
        Ok(Cifar10 { records, image_size })
    }

    fn record(&self, index: usize) -> Result<&[u8]> {
        let start = index * RECORD_LEN;
        self.records
            .get(start..start + RECORD_LEN)
            .ok_or_else(|| out_of_range(index, self.len()))
    }

    pub fn label(&self, index: usize) -> Result<usize> {
        Ok(self.record(index)?[0] as usize)
    }
}

/// Planar `RRR..GGG..BBB` bytes to an interleaved image.
fn planar_to_rgb(pixels: &[u8]) -> RgbImage {
    ImageBuffer::from_fn(SIDE as u32, SIDE as u32, |x, y| {
        let i = y as usize * SIDE + x as usize;
        Rgb([pixels[i], pixels[PIXELS + i], pixels[2 * PIXELS + i]])
    })
}

impl Dataset for Cifar10 {
    fn len(&self) -> usize {
        self.records.len() / RECORD_LEN
    }

    fn image_shape(&self) -> [usize; 3] {
        [3, self.image_size, self.image_size]
    }

    fn load_into(&self, index: usize, output: &mut [Precision], flip: bool) -> Result<usize> {
        check_output(output, self.image_shape())?;
        let record = self.record(index)?;

        let mut image = planar_to_rgb(&record[1..]);
        if self.image_size != SIDE {
            let side = self.image_size as u32;
            image = imageops::resize(&image, side, side, FilterType::Triangle);
        }
        if flip {
            imageops::flip_horizontal_in_place(&mut image);
        }

        let channel_size = self.image_size * self.image_size;
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * self.image_size + x as usize;
            for c in 0..3 {
                let value = pixel[c] as Precision / 255.0;
                output[c * channel_size + offset] = (value - CIFAR10_MEAN[c]) / CIFAR10_STD[c];
            }
        }
        Ok(record[0] as usize)
    }
}

/// Pre-built samples, stored contiguously.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    images: Vec<Precision>,
    labels: Vec<usize>,
    shape: [usize; 3],
}

impl InMemoryDataset {
    pub fn new(images: Vec<Precision>, labels: Vec<usize>, shape: [usize; 3]) -> Result<Self> {
        let per_image = shape.iter().product::<usize>();
        if per_image == 0 || images.len() != labels.len() * per_image {
            return Err(Error::ShapeMismatch {
                stage: "in_memory_dataset".into(),
                expected: format!("{} images of {shape:?}", labels.len()),
                actual: vec![images.len()],
            });
        }
        Ok(InMemoryDataset { images, labels, shape })
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn image_shape(&self) -> [usize; 3] {
        self.shape
    }

    fn load_into(&self, index: usize, output: &mut [Precision], flip: bool) -> Result<usize> {
        check_output(output, self.shape)?;
        let label = *self.labels.get(index).ok_or_else(|| out_of_range(index, self.len()))?;
        let per_image = output.len();
        output.copy_from_slice(&self.images[index * per_image..(index + 1) * per_image]);
        if flip {
            let width = self.shape[2];
            for row in output.chunks_mut(width) {
                row.reverse();
            }
        }
        Ok(label)
    }
}

/// Shuffles `0..len` with a seeded generator and splits off the first
/// `floor(len · valid_ratio)` indices for validation. Returns `(train, valid)`.
pub fn split_indices(len: usize, valid_ratio: f64, seed: u64) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(0.0..1.0).contains(&valid_ratio) {
        return Err(Error::Config(format!("valid_ratio must be in [0, 1), got {valid_ratio}")));
    }
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let split = (len as f64 * valid_ratio).floor() as usize;
    let train = indices.split_off(split);
    Ok((train, indices))
}
