//! Data loader

use ndarray::{Array2, Axis};
use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

/// Errors for the dataloader
#[derive(Debug, Error, PartialEq)]
pub enum DataLoaderError {
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("Cannot load batches from an empty dataset")]
    EmptyDataset,
}

/// A group of samples processed together in one training step
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[batch_size, input_dim]`, one flattened sample per row
    pub inputs: Array2<f32>,
    /// Class index per row
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    inputs: Array2<f32>,
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl DataLoader {
    pub fn new(
        inputs: Array2<f32>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if inputs.nrows() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: inputs.nrows(),
            });
        }
        if labels.is_empty() {
            return Err(DataLoaderError::EmptyDataset);
        }
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        Ok(Self {
            inputs,
            labels,
            batch_size,
            shuffle,
            drop_last: false,
        })
    }

    /// Skips the trailing batch when the dataset size is not a multiple of the batch size
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn input_dim(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches yielded per epoch
    pub fn n_batches(&self) -> usize {
        if self.drop_last {
            self.len() / self.batch_size
        } else {
            self.len().div_ceil(self.batch_size)
        }
    }

    /// Iterates one epoch, reshuffling with the thread-local generator if enabled
    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with(&mut rand::rng())
    }

    /// Iterates one epoch, reshuffling with `rng` if enabled
    pub fn iter_with<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        self.iter_indices(indices)
    }

    /// Iterates one epoch in dataset order, ignoring the shuffle setting
    pub fn iter_ordered(&self) -> DataLoaderIterator<'_> {
        self.iter_indices((0..self.len()).collect())
    }

    fn iter_indices(&self, indices: Vec<usize>) -> DataLoaderIterator<'_> {
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let batch_size = self.loader.batch_size;
        let end = (self.curr_iter + batch_size).min(self.indices.len());
        if self.loader.drop_last && end - self.curr_iter < batch_size {
            self.curr_iter = self.indices.len();
            return None;
        }
        let batch_indices = &self.indices[self.curr_iter..end];
        let inputs = self.loader.inputs.select(Axis(0), batch_indices);
        let labels = batch_indices
            .iter()
            .map(|&i| self.loader.labels[i])
            .collect();
        self.curr_iter = end;
        Some(Batch { inputs, labels })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ndarray::array;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    #[test]
    fn test_dataloader() {
        let data = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let labels = vec![0, 1];
        let dataloader = DataLoader::new(data, labels, 2, false).unwrap();
        let mut iter = dataloader.iter();
        assert_eq!(
            iter.next(),
            Some(Batch {
                inputs: array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
                labels: vec![0, 1],
            })
        );
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_dataloader_shuffle() {
        let seed = 42;
        let data = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let labels = vec![0, 1];
        let dataloader = DataLoader::new(data, labels, 2, true).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let mut iter = dataloader.iter_with(&mut rng);
        assert_eq!(
            iter.next(),
            Some(Batch {
                inputs: array![[4.0, 5.0, 6.0], [1.0, 2.0, 3.0]],
                labels: vec![1, 0],
            })
        );
    }

    #[test]
    fn test_epoch_covers_every_sample_once() {
        let n = 23;
        let data = Array2::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f32);
        let labels = (0..n).collect::<Vec<_>>();
        let dataloader = DataLoader::new(data, labels, 5, true).unwrap();
        assert_eq!(dataloader.n_batches(), 5);

        let mut rng = Pcg64Mcg::seed_from_u64(1);
        for _ in 0..3 {
            let batches = dataloader.iter_with(&mut rng).collect::<Vec<_>>();
            assert_eq!(batches.len(), 5);
            assert_eq!(batches.last().unwrap().len(), 3);
            let mut seen = HashSet::new();
            for batch in batches.iter() {
                for (row, label) in batch.inputs.rows().into_iter().zip(batch.labels.iter()) {
                    // rows stay paired with their labels
                    assert_eq!(row[0], (label * 2) as f32);
                    assert!(seen.insert(*label));
                }
            }
            assert_eq!(seen.len(), n);
        }
    }

    #[test]
    fn test_drop_last() {
        let data = Array2::zeros((7, 1));
        let dataloader = DataLoader::new(data, vec![0; 7], 3, false)
            .unwrap()
            .with_drop_last(true);
        assert_eq!(dataloader.n_batches(), 2);
        let sizes = dataloader.iter().map(|b| b.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![3, 3]);
    }

    #[test]
    fn test_iter_ordered_ignores_shuffle() {
        let data = Array2::from_shape_fn((4, 1), |(i, _)| i as f32);
        let dataloader = DataLoader::new(data, vec![0, 1, 2, 3], 4, true).unwrap();
        let batch = dataloader.iter_ordered().next().unwrap();
        assert_eq!(batch.labels, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_dataloader_errors() {
        // different length data and labels
        let data = Array2::zeros((2, 3));
        let labels = vec![1, 0, 1];
        let expected_label_len = labels.len();
        let expected_data_len = data.nrows();
        let dataloader = DataLoader::new(data, labels, 2, false);
        assert!(matches!(
            dataloader,
            Err(DataLoaderError::LabelLengthMismatch {
                label_len,
                data_len,
            }) if label_len == expected_label_len && data_len == expected_data_len
        ));

        assert!(matches!(
            DataLoader::new(Array2::zeros((2, 3)), vec![0, 1], 0, false),
            Err(DataLoaderError::ZeroBatchSize)
        ));
        assert!(matches!(
            DataLoader::new(Array2::zeros((0, 3)), vec![], 1, false),
            Err(DataLoaderError::EmptyDataset)
        ));
    }
}
