//! Classification datasets: synthetic generators and a reader for IDX image files
//!
//! Every loader returns an `[n_samples, input_dim]` matrix of flattened samples and a
//! vector of class indices.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

/// Side length of an MNIST-style square image
pub const IMAGE_SIZE: usize = 28;

const BLOBS_CLASSES: usize = 4;
const BLOBS_DIM: usize = 8;

const IDX_LABELS_MAGIC: u32 = 2049;
const IDX_IMAGES_MAGIC: u32 = 2051;

/// Errors while loading a dataset
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Bad IDX magic number: expected {expected}, got {got}")]
    BadMagic { expected: u32, got: u32 },
    #[error("IDX data is truncated: needed {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("Image file holds {images} samples but label file holds {labels}")]
    CountMismatch { images: usize, labels: usize },
    #[error("IDX header describes {n} images of {rows}x{cols} pixels, which overflows")]
    HeaderOverflow { n: usize, rows: usize, cols: usize },
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Line,
    Circle,
    Xor,
    Moon,
    /// Gaussian clusters in a higher dimensional space
    Blobs,
    /// Synthetic seven-segment style digits rendered as 28x28 images
    Digits,
    /// MNIST or Fashion-MNIST IDX files from a local directory
    Mnist,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::Xor => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
            Dataset::Blobs => write!(f, "blobs"),
            Dataset::Digits => write!(f, "digits"),
            Dataset::Mnist => write!(f, "mnist"),
        }
    }
}

impl Dataset {
    /// Width of a flattened sample
    pub fn input_dim(self) -> usize {
        match self {
            Dataset::Line | Dataset::Circle | Dataset::Xor | Dataset::Moon => 2,
            Dataset::Blobs => BLOBS_DIM,
            Dataset::Digits | Dataset::Mnist => IMAGE_SIZE * IMAGE_SIZE,
        }
    }

    pub fn n_classes(self) -> usize {
        match self {
            Dataset::Line | Dataset::Circle | Dataset::Xor | Dataset::Moon => 2,
            Dataset::Blobs => BLOBS_CLASSES,
            Dataset::Digits | Dataset::Mnist => 10,
        }
    }
}

/// Which half of a dataset to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn idx_prefix(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }
}

/// Loads one split of a dataset
///
/// Synthetic datasets draw `class_size` fresh samples per class from `rng` for each
/// split. `Mnist` reads `<split>-images-idx3-ubyte` and `<split>-labels-idx1-ubyte`
/// from `data_dir` and ignores `class_size`.
pub fn load_split<R: Rng + ?Sized>(
    dataset: Dataset,
    split: Split,
    class_size: usize,
    data_dir: &Path,
    rng: &mut R,
) -> Result<(Array2<f32>, Vec<usize>), DatasetError> {
    let data = match dataset {
        Dataset::Line => gen_linear_data(class_size, rng),
        Dataset::Circle => gen_circle_data(class_size, rng),
        Dataset::Xor => gen_xor_data(class_size, rng),
        Dataset::Moon => gen_moon_data(class_size, rng),
        Dataset::Blobs => {
            // centres must agree between splits, so they come from a fixed stream
            let centres = blob_centres(BLOBS_CLASSES, BLOBS_DIM);
            gen_blobs(&centres, class_size, 1.0, rng)
        }
        Dataset::Digits => gen_digit_images(class_size, rng),
        Dataset::Mnist => return load_mnist(data_dir, split),
    };
    Ok(data)
}

fn to_matrix(points: Vec<[f32; 2]>) -> Array2<f32> {
    Array2::from(points)
}

/// Generates a simple linearly separable dataset
pub fn gen_linear_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> (Array2<f32>, Vec<usize>) {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..2 * class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        data.push([x, y]);
        labels.push(if x > y { 0 } else { 1 });
    }

    (to_matrix(data), labels)
}

/// Generates a binary classification dataset of two concentric circles
pub fn gen_circle_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> (Array2<f32>, Vec<usize>) {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for (label, radius) in [(0, 3.0f32), (1, 5.0f32)] {
        for _ in 0..class_size {
            let angle: f32 = rng.random_range(0.0..2.0 * PI);
            let radius_delta = radius * rng.random_range(-0.25f32..0.25);
            let x = (radius + radius_delta) * angle.cos();
            let y = (radius + radius_delta) * angle.sin();
            data.push([x, y]);
            labels.push(label);
        }
    }

    (to_matrix(data), labels)
}

/// Points in the four quadrants, labelled by the sign of `x * y`
pub fn gen_xor_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> (Array2<f32>, Vec<usize>) {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..2 * class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        data.push([x, y]);
        labels.push(if x * y > 0.0 { 0 } else { 1 });
    }

    (to_matrix(data), labels)
}

/// Generates a moons dataset (two interleaving partial circles) for binary classification
pub fn gen_moon_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> (Array2<f32>, Vec<usize>) {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let radius = 3.0f32;

    // First moon
    for _ in 0..class_size {
        let theta: f32 = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
        let noise_x: f32 = rng.random_range(-0.1..0.1);
        let noise_y: f32 = rng.random_range(-0.1..0.1);
        data.push([radius * theta.cos() + noise_x, radius * theta.sin() + noise_y]);
        labels.push(0);
    }

    // Second moon
    for _ in 0..class_size {
        let theta: f32 = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
        let noise_x: f32 = rng.random_range(-0.1..0.1);
        let noise_y: f32 = rng.random_range(-0.1..0.1);
        data.push([
            radius * theta.cos() + 2.0 + noise_x,
            -radius * theta.sin() - 0.2 + noise_y,
        ]);
        labels.push(1);
    }

    (to_matrix(data), labels)
}

/// Deterministic cluster centres in `[-5, 5)^dim`
pub fn blob_centres(n_classes: usize, dim: usize) -> Array2<f32> {
    use rand::SeedableRng;
    let mut rng = rand_pcg::Pcg64Mcg::seed_from_u64(0x5eed);
    Array2::from_shape_simple_fn((n_classes, dim), || rng.random_range(-5.0..5.0))
}

/// Isotropic Gaussian clusters around each row of `centres`, one class per centre
pub fn gen_blobs<R: Rng + ?Sized>(
    centres: &Array2<f32>,
    class_size: usize,
    spread: f32,
    rng: &mut R,
) -> (Array2<f32>, Vec<usize>) {
    let dim = centres.ncols();
    let n = centres.nrows() * class_size;
    let mut data = Array2::zeros((n, dim));
    let mut labels = Vec::with_capacity(n);

    for (mut row, i) in data.rows_mut().into_iter().zip(0..n) {
        let label = i / class_size;
        let centre = centres.row(label);
        let noise = Array1::from_shape_simple_fn(dim, || {
            let z: f32 = rng.sample(StandardNormal);
            z * spread
        });
        row.assign(&(&centre + &noise));
        labels.push(label);
    }

    (data, labels)
}

// Seven-segment layout of a digit glyph: a (top), b (upper right), c (lower right),
// d (bottom), e (lower left), f (upper left), g (middle)
const SEGMENTS: [[bool; 7]; 10] = [
    [true, true, true, true, true, true, false],
    [false, true, true, false, false, false, false],
    [true, true, false, true, true, false, true],
    [true, true, true, true, false, false, true],
    [false, true, true, false, false, true, true],
    [true, false, true, true, false, true, true],
    [true, false, true, true, true, true, true],
    [true, true, true, false, false, false, false],
    [true, true, true, true, true, true, true],
    [true, true, true, true, false, true, true],
];

const GLYPH_WIDTH: usize = 12;
const GLYPH_HEIGHT: usize = 20;

/// Whether pixel `(row, col)` of a glyph lies on a lit segment
fn on_segment(digit: usize, row: usize, col: usize, thickness: usize) -> bool {
    let (w, h, t) = (GLYPH_WIDTH, GLYPH_HEIGHT, thickness);
    let mid = h / 2;
    let upper = row < mid;
    let boxes = [
        row < t,
        col >= w - t && upper,
        col >= w - t && !upper,
        row >= h - t,
        col < t && !upper,
        col < t && upper,
        row >= mid - t / 2 && row < mid - t / 2 + t,
    ];
    SEGMENTS[digit]
        .iter()
        .zip(boxes.iter())
        .any(|(lit, inside)| *lit && *inside)
}

/// Renders `class_size` jittered 28x28 images per digit, flattened row-major with
/// pixel values in `[0, 1]`
pub fn gen_digit_images<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> (Array2<f32>, Vec<usize>) {
    let dim = IMAGE_SIZE * IMAGE_SIZE;
    let n = 10 * class_size;
    let mut data = Array2::zeros((n, dim));
    let mut labels = Vec::with_capacity(n);

    for (mut pixels, i) in data.rows_mut().into_iter().zip(0..n) {
        let digit = i % 10;
        let thickness = rng.random_range(2..=3);
        let top = (IMAGE_SIZE - GLYPH_HEIGHT) / 2;
        let left = (IMAGE_SIZE - GLYPH_WIDTH) / 2;
        let top = top.saturating_add_signed(rng.random_range(-2i32..=2) as isize);
        let left = left.saturating_add_signed(rng.random_range(-3i32..=3) as isize);
        let intensity: f32 = rng.random_range(0.7..1.0);

        for (idx, pixel) in pixels.iter_mut().enumerate() {
            let (row, col) = (idx / IMAGE_SIZE, idx % IMAGE_SIZE);
            let lit = row >= top
                && col >= left
                && row < top + GLYPH_HEIGHT
                && col < left + GLYPH_WIDTH
                && on_segment(digit, row - top, col - left, thickness);
            let background: f32 = rng.random_range(0.0..0.1);
            *pixel = if lit {
                (intensity + background).min(1.0)
            } else {
                background
            };
        }
        labels.push(digit);
    }

    (data, labels)
}

/// Maps a raw 8-bit pixel to `[-1, 1]`, i.e. scaling to `[0, 1]` then normalising
/// with mean 0.5 and standard deviation 0.5
pub fn normalize_pixel(pixel: u8) -> f32 {
    (pixel as f32 / 255.0 - 0.5) / 0.5
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, DatasetError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(u32::from_be_bytes)
        .ok_or(DatasetError::Truncated {
            needed: offset + 4,
            have: bytes.len(),
        })
}

fn check_magic(bytes: &[u8], expected: u32) -> Result<(), DatasetError> {
    let got = read_u32(bytes, 0)?;
    if got != expected {
        return Err(DatasetError::BadMagic { expected, got });
    }
    Ok(())
}

/// Parses an IDX3 image file into normalised, flattened rows
pub fn parse_idx_images(bytes: &[u8]) -> Result<Array2<f32>, DatasetError> {
    check_magic(bytes, IDX_IMAGES_MAGIC)?;
    let n = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    let needed = rows
        .checked_mul(cols)
        .and_then(|dim| dim.checked_mul(n))
        .and_then(|len| len.checked_add(16))
        .ok_or(DatasetError::HeaderOverflow { n, rows, cols })?;
    let dim = rows * cols;
    let pixels = bytes.get(16..needed).ok_or(DatasetError::Truncated {
        needed,
        have: bytes.len(),
    })?;
    let data = pixels.iter().map(|&p| normalize_pixel(p)).collect();
    Ok(Array2::from_shape_vec((n, dim), data)?)
}

/// Parses an IDX1 label file
pub fn parse_idx_labels(bytes: &[u8]) -> Result<Vec<usize>, DatasetError> {
    check_magic(bytes, IDX_LABELS_MAGIC)?;
    let n = read_u32(bytes, 4)? as usize;
    let needed = 8 + n;
    let labels = bytes.get(8..needed).ok_or(DatasetError::Truncated {
        needed,
        have: bytes.len(),
    })?;
    Ok(labels.iter().map(|&l| l as usize).collect())
}

fn read_file(path: PathBuf) -> Result<Vec<u8>, DatasetError> {
    fs::read(&path).map_err(|source| DatasetError::Io { path, source })
}

/// Loads an MNIST-format split (MNIST and Fashion-MNIST share file names and layout)
pub fn load_mnist(data_dir: &Path, split: Split) -> Result<(Array2<f32>, Vec<usize>), DatasetError> {
    let prefix = split.idx_prefix();
    let images = parse_idx_images(&read_file(
        data_dir.join(format!("{}-images-idx3-ubyte", prefix)),
    )?)?;
    let labels = parse_idx_labels(&read_file(
        data_dir.join(format!("{}-labels-idx1-ubyte", prefix)),
    )?)?;
    if images.nrows() != labels.len() {
        return Err(DatasetError::CountMismatch {
            images: images.nrows(),
            labels: labels.len(),
        });
    }
    log::info!(
        "Loaded {} {:?} samples from '{}'",
        labels.len(),
        split,
        data_dir.display()
    );
    Ok((images, labels))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::assert_eq_float;

    fn idx_images(n: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IDX_IMAGES_MAGIC, n, rows, cols] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_synthetic_shapes_and_labels() {
        let mut rng = Pcg64Mcg::seed_from_u64(4);
        for dataset in [
            Dataset::Line,
            Dataset::Circle,
            Dataset::Xor,
            Dataset::Moon,
            Dataset::Blobs,
            Dataset::Digits,
        ] {
            let (data, labels) =
                load_split(dataset, Split::Train, 10, Path::new("."), &mut rng).unwrap();
            assert_eq!(data.nrows(), labels.len(), "{}", dataset);
            assert_eq!(data.ncols(), dataset.input_dim(), "{}", dataset);
            assert!(labels.iter().all(|l| *l < dataset.n_classes()), "{}", dataset);
            assert!(data.iter().all(|v| v.is_finite()), "{}", dataset);
        }
    }

    #[test]
    fn test_balanced_generators() {
        let mut rng = Pcg64Mcg::seed_from_u64(4);
        let (_, labels) = gen_circle_data(7, &mut rng);
        assert_eq!(labels.iter().filter(|l| **l == 0).count(), 7);
        let (data, labels) = gen_digit_images(3, &mut rng);
        assert_eq!(data.nrows(), 30);
        for digit in 0..10 {
            assert_eq!(labels.iter().filter(|l| **l == digit).count(), 3);
        }
        assert!(data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_digit_glyphs_differ() {
        let lit = |digit| {
            (0..GLYPH_HEIGHT)
                .flat_map(|r| (0..GLYPH_WIDTH).map(move |c| (r, c)))
                .filter(|&(r, c)| on_segment(digit, r, c, 2))
                .count()
        };
        // 8 lights every segment, 1 only two
        assert!(lit(8) > lit(0));
        assert!(lit(0) > lit(7));
        assert!(lit(7) > lit(1));
    }

    #[test]
    fn test_blob_centres_are_fixed() {
        assert_eq!(blob_centres(3, 2), blob_centres(3, 2));
    }

    #[test]
    fn test_parse_idx() {
        let images = parse_idx_images(&idx_images(2, 2, 2, &[0, 255, 51, 204, 0, 0, 0, 255])).unwrap();
        assert_eq!(images.shape(), &[2, 4]);
        assert_eq_float!(images[[0, 0]], -1.0);
        assert_eq_float!(images[[0, 1]], 1.0);
        assert_eq_float!(images[[0, 2]], -0.6);
        assert_eq_float!(images[[1, 3]], 1.0);

        let labels = parse_idx_labels(&idx_labels(&[3, 9])).unwrap();
        assert_eq!(labels, vec![3, 9]);
    }

    #[test]
    fn test_parse_idx_errors() {
        assert!(matches!(
            parse_idx_images(&idx_labels(&[1])),
            Err(DatasetError::BadMagic {
                expected: IDX_IMAGES_MAGIC,
                got: IDX_LABELS_MAGIC
            })
        ));
        assert!(matches!(
            parse_idx_images(&idx_images(2, 2, 2, &[0, 1, 2])),
            Err(DatasetError::Truncated { needed: 24, have: 19 })
        ));
        assert!(matches!(
            parse_idx_images(&idx_images(u32::MAX, u32::MAX, u32::MAX, &[])),
            Err(DatasetError::HeaderOverflow { .. })
        ));
        assert!(matches!(
            parse_idx_labels(&[0, 0]),
            Err(DatasetError::Truncated { needed: 4, have: 2 })
        ));
    }

    #[test]
    fn test_load_mnist_missing_dir() {
        let err = load_mnist(Path::new("/nonexistent/mnist"), Split::Test).unwrap_err();
        assert!(matches!(err, DatasetError::Io { .. }));
    }

    #[test]
    fn test_load_mnist_from_files() {
        let dir = std::env::temp_dir().join(format!("mlp-rs-idx-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("train-images-idx3-ubyte"),
            idx_images(3, 1, 2, &[0, 0, 255, 255, 0, 255]),
        )
        .unwrap();
        fs::write(dir.join("train-labels-idx1-ubyte"), idx_labels(&[0, 1, 2])).unwrap();
        let (images, labels) = load_mnist(&dir, Split::Train).unwrap();
        assert_eq!(images.shape(), &[3, 2]);
        assert_eq!(labels, vec![0, 1, 2]);

        fs::write(dir.join("train-labels-idx1-ubyte"), idx_labels(&[0, 1])).unwrap();
        assert!(matches!(
            load_mnist(&dir, Split::Train),
            Err(DatasetError::CountMismatch { images: 3, labels: 2 })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
