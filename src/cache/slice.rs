// SPDX-License-Identifier: MIT OR Apache-2.0

//! Position selectors.

use candle_core::{Device, Tensor};

use crate::error::{LensError, Result};

/// Selects positions along one axis of a cached tensor.
///
/// Negative indices count from the end, as in Python slicing.
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_lens::Slice;
///
/// let t = Tensor::arange(0u32, 6, &Device::Cpu).unwrap();
/// let last = Slice::Index(-1).apply(&t, 0).unwrap();
/// assert_eq!(last.to_scalar::<u32>().unwrap(), 5);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Slice {
    /// Keep the axis unchanged.
    #[default]
    All,
    /// One position; the axis is removed.
    Index(isize),
    /// Half-open range `start..end`; `None` runs to the end.
    Range(isize, Option<isize>),
    /// Explicit positions, in the given order.
    Indices(Vec<usize>),
}

impl Slice {
    /// The last position.
    #[must_use]
    pub const fn last() -> Self {
        Self::Index(-1)
    }

    /// Apply the selector to axis `dim` of `tensor`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] for positions outside the axis and
    /// [`LensError::Model`] on tensor failures.
    pub fn apply(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        let len = tensor.dim(dim)?;
        match self {
            Self::All => Ok(tensor.clone()),
            Self::Index(i) => {
                let i = resolve(*i, len, false)?;
                Ok(tensor.narrow(dim, i, 1)?.squeeze(dim)?)
            }
            Self::Range(start, end) => {
                let start = resolve(*start, len, true)?;
                let end = end.map_or(Ok(len), |e| resolve(e, len, true))?;
                Ok(tensor.narrow(dim, start, end.saturating_sub(start))?)
            }
            Self::Indices(indices) => {
                if let Some(bad) = indices.iter().find(|&&i| i >= len) {
                    return Err(out_of_range(*bad as isize, len));
                }
                let ids: Vec<u32> = indices
                    .iter()
                    .map(|&i| u32::try_from(i).map_err(|_| out_of_range(i as isize, len)))
                    .collect::<Result<_>>()?;
                let ids = Tensor::new(ids.as_slice(), &Device::Cpu)?.to_device(tensor.device())?;
                Ok(tensor.index_select(&ids, dim)?)
            }
        }
    }
}

impl From<isize> for Slice {
    fn from(i: isize) -> Self {
        Self::Index(i)
    }
}

impl From<Vec<usize>> for Slice {
    fn from(indices: Vec<usize>) -> Self {
        Self::Indices(indices)
    }
}

/// Map a possibly negative index into `0..len` (`0..=len` for range bounds).
fn resolve(i: isize, len: usize, bound: bool) -> Result<usize> {
    let signed_len = isize::try_from(len).map_err(|_| out_of_range(i, len))?;
    let resolved = if i < 0 { signed_len + i } else { i };
    let limit = if bound { signed_len } else { signed_len - 1 };
    if resolved < 0 || resolved > limit {
        return Err(out_of_range(i, len));
    }
    usize::try_from(resolved).map_err(|_| out_of_range(i, len))
}

fn out_of_range(i: isize, len: usize) -> LensError {
    LensError::Hook(format!("position {i} is out of range for length {len}"))
}
