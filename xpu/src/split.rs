//! Row partitioning of tensors across devices.
//!
//! A tensor with `R` rows is cut into one contiguous row range per device. Boundaries are
//! placed at `R * cumulative_weight[i]` rounded down to a multiple of the rounding unit, the
//! first device always starts at row 0 and the last device always ends at row `R`.

use crate::{
    error::{BackendError, ErrorStatus},
    tensor::Tensor,
    DType, MATRIX_ROW_PADDING, MAX_DEVICES,
};

/// Cumulative split fractions, `fractions[i]` is the share of rows owned by devices before `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSplit {
    fractions: Vec<f32>,
}

impl TensorSplit {
    pub fn equal(devices: usize) -> TensorSplit {
        debug_assert!(devices > 0);
        TensorSplit { fractions: (0..devices).map(|i| i as f32 / devices as f32).collect() }
    }

    /// Normalizes per device weights. Missing trailing weights are zero,
    /// all zero weights mean an equal split.
    pub fn from_weights(weights: &[f32], devices: usize) -> Result<TensorSplit, BackendError> {
        if devices == 0 || devices > MAX_DEVICES {
            return Err(BackendError::new(
                ErrorStatus::DeviceQuery,
                format!("split over {devices} devices, supported are 1 to {MAX_DEVICES}"),
            ));
        }
        if weights.len() > devices {
            return Err(BackendError::new(
                ErrorStatus::InvalidBuffer,
                format!("{} split weights for {devices} devices", weights.len()),
            ));
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(BackendError::new(ErrorStatus::InvalidBuffer, format!("invalid split weight {w}")));
        }
        let total: f32 = weights.iter().sum();
        if total == 0.0 {
            return Ok(TensorSplit::equal(devices));
        }
        let mut fractions = Vec::with_capacity(devices);
        let mut acc = 0.0;
        for i in 0..devices {
            fractions.push(acc / total);
            acc += weights.get(i).copied().unwrap_or(0.0);
        }
        Ok(TensorSplit { fractions })
    }

    pub fn devices(&self) -> usize {
        self.fractions.len()
    }

    pub fn fractions(&self) -> &[f32] {
        &self.fractions
    }
}

/// Half open range of rows `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub low: i64,
    pub high: i64,
}

impl RowRange {
    pub fn rows(self) -> i64 {
        self.high - self.low
    }

    pub fn is_empty(self) -> bool {
        self.high <= self.low
    }
}

fn boundary(nrows: i64, fraction: f32, rounding: i64) -> i64 {
    let row = (nrows as f64 * fraction as f64) as i64;
    row - row % rounding
}

/// Rows of a tensor with `nrows` rows owned by `device`.
///
/// Boundaries round down, so an equal split of 100 rows over two devices with rounding 32 is
/// `[0, 32)` and `[32, 100)`.
pub fn row_range(nrows: i64, split: &TensorSplit, device: usize, rounding: i64) -> RowRange {
    debug_assert!(rounding > 0);
    debug_assert!(device < split.devices());
    let low = if device == 0 { 0 } else { boundary(nrows, split.fractions[device], rounding) };
    let high = if device + 1 == split.devices() {
        nrows
    } else {
        boundary(nrows, split.fractions[device + 1], rounding)
    };
    RowRange { low, high }
}

/// Bytes to allocate for `rows` rows of `ne0` elements, including tail padding
/// for kernels that read whole `MATRIX_ROW_PADDING` chunks.
pub fn padded_slice_size(dtype: DType, ne0: i64, rows: i64) -> usize {
    let size = rows as usize * dtype.row_size(ne0);
    if ne0 % MATRIX_ROW_PADDING != 0 {
        size + dtype.row_size(MATRIX_ROW_PADDING - ne0 % MATRIX_ROW_PADDING)
    } else {
        size
    }
}

/// Split weights together with the rounding unit, everything needed to place a tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitLayout {
    pub split: TensorSplit,
    pub rounding: i64,
}

impl SplitLayout {
    pub fn devices(&self) -> usize {
        self.split.devices()
    }

    /// Rows of `tensor` owned by `device`, counting every row of every batch.
    pub fn rows(&self, tensor: &Tensor, device: usize) -> RowRange {
        row_range(tensor.nrows(), &self.split, device, self.rounding)
    }

    /// Padded bytes of `device`'s slice, zero when the device owns no rows
    pub fn slice_size(&self, tensor: &Tensor, device: usize) -> usize {
        let range = self.rows(tensor, device);
        if range.is_empty() {
            0
        } else {
            padded_slice_size(tensor.dtype, tensor.ne[0], range.rows())
        }
    }

    pub fn alloc_size(&self, tensor: &Tensor) -> usize {
        (0..self.devices()).map(|d| self.slice_size(tensor, d)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn equal_split_two_devices() {
        let split = TensorSplit::equal(2);
        assert_eq!(row_range(100, &split, 0, 32), RowRange { low: 0, high: 32 });
        assert_eq!(row_range(100, &split, 1, 32), RowRange { low: 32, high: 100 });
    }

    #[test]
    fn last_device_absorbs_remainder() -> Result<(), BackendError> {
        let split = TensorSplit::from_weights(&[0.97, 0.03], 2)?;
        assert_eq!(row_range(100, &split, 0, 32), RowRange { low: 0, high: 96 });
        assert_eq!(row_range(100, &split, 1, 32), RowRange { low: 96, high: 100 });
        Ok(())
    }

    #[test]
    fn collapsed_slices() -> Result<(), BackendError> {
        // 20 rows do not reach the first rounding boundary, so every row stays with the last device
        let split = TensorSplit::equal(3);
        assert!(row_range(20, &split, 0, 32).is_empty());
        assert!(row_range(20, &split, 1, 32).is_empty());
        assert_eq!(row_range(20, &split, 2, 32), RowRange { low: 0, high: 20 });
        let split = TensorSplit::from_weights(&[1.0, 0.0], 2)?;
        assert_eq!(row_range(64, &split, 1, 32), RowRange { low: 64, high: 64 });
        Ok(())
    }

    #[test]
    fn weights_validation() {
        assert!(TensorSplit::from_weights(&[1.0, -1.0], 2).is_err());
        assert!(TensorSplit::from_weights(&[f32::NAN], 2).is_err());
        assert!(TensorSplit::from_weights(&[1.0, 1.0, 1.0], 2).is_err());
        assert!(TensorSplit::from_weights(&[], 0).is_err());
        assert_eq!(TensorSplit::from_weights(&[0.0, 0.0], 2).ok(), Some(TensorSplit::equal(2)));
        assert_eq!(TensorSplit::from_weights(&[3.0], 2).ok().map(|s| s.fractions), Some(vec![0.0, 1.0]));
    }

    #[test]
    fn padding() {
        assert_eq!(padded_slice_size(DType::F32, 512, 3), 3 * 2048);
        assert_eq!(padded_slice_size(DType::F32, 100, 3), 3 * 400 + 412 * 4);
        assert_eq!(padded_slice_size(DType::Q4_0, 4096, 2), 2 * 2304);
        assert_eq!(padded_slice_size(DType::Q4_0, 96, 1), 54 + 234);
    }

    fn weights() -> impl Strategy<Value = Vec<f32>> {
        (1usize..=MAX_DEVICES).prop_flat_map(|d| proptest::collection::vec(0.0f32..10.0, d))
    }

    proptest! {
        #[test]
        fn ranges_cover_all_rows(w in weights(), nrows in 0i64..100_000, rounding in prop::sample::select(vec![1i64, 2, 32, 64, 128])) {
            let split = TensorSplit::from_weights(&w, w.len()).unwrap();
            let mut next = 0;
            for device in 0..w.len() {
                let r = row_range(nrows, &split, device, rounding);
                prop_assert_eq!(r.low, next);
                prop_assert!(r.high >= r.low);
                next = r.high;
            }
            prop_assert_eq!(next, nrows);
        }

        #[test]
        fn boundaries_are_rounded(w in weights(), nrows in 0i64..100_000) {
            let split = TensorSplit::from_weights(&w, w.len()).unwrap();
            prop_assert_eq!(row_range(nrows, &split, 0, 32).low, 0);
            for device in 1..w.len() {
                prop_assert_eq!(row_range(nrows, &split, device, 32).low % 32, 0);
            }
            prop_assert_eq!(row_range(nrows, &split, w.len() - 1, 32).high, nrows);
        }

        #[test]
        fn padding_is_monotone(ne0 in 1i64..5000, rows in 0i64..64) {
            let exact = rows as usize * DType::F32.row_size(ne0);
            let padded = padded_slice_size(DType::F32, ne0, rows);
            prop_assert!(padded >= exact);
            prop_assert_eq!(padded == exact, ne0 % MATRIX_ROW_PADDING == 0);
        }
    }
}
