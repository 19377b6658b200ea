// SPDX-License-Identifier: MIT OR Apache-2.0

//! Low-rank matrices kept as the product of two factors.
//!
//! A [`FactoredMatrix`] represents `AB` with `A: [..., ldim, mdim]` and
//! `B: [..., mdim, rdim]` without materialising the product.  Circuits such
//! as `W_Q W_Kᵀ` (the QK circuit) and `W_V W_O` (the OV circuit) are
//! naturally of this form, and their spectra can be computed from small
//! `mdim`-sized matrices.
//!
//! Linear algebra (SVD, eigenvalues) runs in `f64` through `nalgebra`, one
//! leading index at a time.

use std::sync::OnceLock;

use candle_core::{DType, Device, IndexOp, Tensor};
use nalgebra::DMatrix;

use crate::error::{LensError, Result};

/// Result of multiplying a factored matrix by a tensor.
#[derive(Debug, Clone)]
pub enum Product {
    /// The operand was a vector; the product is a dense vector.
    Vector(Tensor),
    /// The operand was a matrix; the product stays factored.
    Matrix(FactoredMatrix),
}

impl Product {
    /// The dense vector, if the operand was a vector.
    #[must_use]
    pub fn into_vector(self) -> Option<Tensor> {
        match self {
            Self::Vector(t) => Some(t),
            Self::Matrix(_) => None,
        }
    }

    /// The factored product, if the operand was a matrix.
    #[must_use]
    pub fn into_matrix(self) -> Option<FactoredMatrix> {
        match self {
            Self::Vector(_) => None,
            Self::Matrix(m) => Some(m),
        }
    }
}

/// Cached singular value decomposition: `U [.., ldim, k]`, `S [.., k]`,
/// `V [.., rdim, k]`.
#[derive(Debug, Clone)]
struct Svd {
    u: Tensor,
    s: Tensor,
    v: Tensor,
}

/// A matrix `AB` stored as its two factors.
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_lens::FactoredMatrix;
///
/// let a = Tensor::new(&[[1.0_f32, 0.0], [0.0, 2.0], [1.0, 1.0]], &Device::Cpu).unwrap();
/// let b = Tensor::new(&[[1.0_f32, 2.0, 3.0], [0.0, 1.0, 0.0]], &Device::Cpu).unwrap();
/// let fm = FactoredMatrix::new(a, b).unwrap();
/// assert_eq!(fm.shape(), vec![3, 3]);
/// assert_eq!(fm.mdim(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct FactoredMatrix {
    a: Tensor,
    b: Tensor,
    ldim: usize,
    mdim: usize,
    rdim: usize,
    svd: OnceLock<Svd>,
}

impl FactoredMatrix {
    /// Build `AB` from `a: [..., ldim, mdim]` and `b: [..., mdim, rdim]`.
    ///
    /// Leading dimensions broadcast against each other.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::FactoredMatrix`] if either factor has fewer than
    /// two dimensions, the inner dimensions differ, or the leading
    /// dimensions do not broadcast.
    pub fn new(a: Tensor, b: Tensor) -> Result<Self> {
        if a.rank() < 2 || b.rank() < 2 {
            return Err(LensError::FactoredMatrix(format!(
                "factors need at least two dimensions, got {:?} and {:?}",
                a.dims(),
                b.dims()
            )));
        }
        let (a_lead, a_tail) = a.dims().split_at(a.rank() - 2);
        let (b_lead, b_tail) = b.dims().split_at(b.rank() - 2);
        let (ldim, mdim, b_mdim, rdim) = (a_tail[0], a_tail[1], b_tail[0], b_tail[1]);
        if mdim != b_mdim {
            return Err(LensError::FactoredMatrix(format!(
                "inner dimensions differ: A is {:?}, B is {:?}",
                a.dims(),
                b.dims()
            )));
        }
        let lead = broadcast_leading(a_lead, b_lead)?;
        let a = broadcast_to(a, &lead, ldim, mdim)?;
        let b = broadcast_to(b, &lead, mdim, rdim)?;
        Ok(Self {
            a,
            b,
            ldim,
            mdim,
            rdim,
            svd: OnceLock::new(),
        })
    }

    /// Left factor `A: [..., ldim, mdim]`.
    #[must_use]
    pub const fn a(&self) -> &Tensor {
        &self.a
    }

    /// Right factor `B: [..., mdim, rdim]`.
    #[must_use]
    pub const fn b(&self) -> &Tensor {
        &self.b
    }

    /// Both factors.
    #[must_use]
    pub const fn pair(&self) -> (&Tensor, &Tensor) {
        (&self.a, &self.b)
    }

    /// Rows of `AB`.
    #[must_use]
    pub const fn ldim(&self) -> usize {
        self.ldim
    }

    /// Shared inner dimension.
    #[must_use]
    pub const fn mdim(&self) -> usize {
        self.mdim
    }

    /// Columns of `AB`.
    #[must_use]
    pub const fn rdim(&self) -> usize {
        self.rdim
    }

    /// Leading dimensions (everything but the last two).
    #[must_use]
    pub fn leading(&self) -> &[usize] {
        let dims = self.a.dims();
        &dims[..dims.len() - 2]
    }

    /// Shape of `AB`: `[..., ldim, rdim]`.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = self.leading().to_vec();
        shape.extend([self.ldim, self.rdim]);
        shape
    }

    /// Number of dimensions of `AB`.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.a.rank()
    }

    /// The dense product `AB`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn ab(&self) -> Result<Tensor> {
        Ok(self.a.matmul(&self.b)?)
    }

    /// The small product `BA` (`[..., mdim, mdim]`).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::FactoredMatrix`] unless `ldim == rdim`.
    pub fn ba(&self) -> Result<Tensor> {
        if self.ldim != self.rdim {
            return Err(LensError::FactoredMatrix(format!(
                "BA needs a square product, got ldim {} and rdim {}",
                self.ldim, self.rdim
            )));
        }
        Ok(self.b.matmul(&self.a)?)
    }

    /// Transpose: `(AB)ᵀ = Bᵀ Aᵀ`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn t(&self) -> Result<Self> {
        let rank = self.a.rank();
        Self::new(
            self.b.transpose(rank - 2, rank - 1)?.contiguous()?,
            self.a.transpose(rank - 2, rank - 1)?.contiguous()?,
        )
    }

    /// `self @ other`.
    ///
    /// A vector `[rdim]` gives the dense `[..., ldim]`.  A matrix
    /// `[..., rdim, k]` gives a factored product, folding `other` into
    /// whichever side keeps the inner dimension smallest.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::FactoredMatrix`] on mismatched dimensions.
    pub fn matmul(&self, other: &Tensor) -> Result<Product> {
        if other.rank() == 1 {
            check_dim(other.dim(0)?, self.rdim, "right operand")?;
            let col = other.unsqueeze(1)?;
            let out = self.a.broadcast_matmul(&self.b.broadcast_matmul(&col)?)?;
            let last = out.rank() - 1;
            return Ok(Product::Vector(out.squeeze(last)?));
        }
        check_dim(other.dim(other.rank() - 2)?, self.rdim, "right operand")?;
        let fm = if self.rdim > self.mdim {
            Self::new(self.a.clone(), self.b.broadcast_matmul(other)?)?
        } else {
            Self::new(self.ab()?, other.clone())?
        };
        Ok(Product::Matrix(fm))
    }

    /// `other @ self`.
    ///
    /// A vector `[ldim]` gives the dense `[..., rdim]`; a matrix
    /// `[..., k, ldim]` gives a factored product.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::FactoredMatrix`] on mismatched dimensions.
    pub fn rmatmul(&self, other: &Tensor) -> Result<Product> {
        if other.rank() == 1 {
            check_dim(other.dim(0)?, self.ldim, "left operand")?;
            let row = other.unsqueeze(0)?;
            let out = row.broadcast_matmul(&self.a)?.broadcast_matmul(&self.b)?;
            // The singleton is the row axis, second to last.
            let row_axis = out.rank() - 2;
            return Ok(Product::Vector(out.squeeze(row_axis)?));
        }
        check_dim(other.dim(other.rank() - 1)?, self.ldim, "left operand")?;
        let fm = if self.ldim > self.mdim {
            Self::new(other.broadcast_matmul(&self.a)?, self.b.clone())?
        } else {
            Self::new(other.clone(), self.ab()?)?
        };
        Ok(Product::Matrix(fm))
    }

    /// `self @ other` for two factored matrices.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::FactoredMatrix`] on mismatched dimensions.
    pub fn compose(&self, other: &Self) -> Result<Self> {
        let left = self
            .matmul(&other.a)?
            .into_matrix()
            .ok_or_else(|| LensError::FactoredMatrix("compose: vector factor".into()))?;
        left.matmul(&other.b)?
            .into_matrix()
            .ok_or_else(|| LensError::FactoredMatrix("compose: vector factor".into()))
    }

    /// Multiply by a scalar (applied to `A`).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn scale(&self, factor: f64) -> Result<Self> {
        Self::new((&self.a * factor)?, self.b.clone())
    }

    /// Add a leading dimension at `dim` (which must address the leading
    /// dimensions, `0..=leading().len()`).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::FactoredMatrix`] if `dim` would split the matrix
    /// dimensions.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        if dim > self.leading().len() {
            return Err(LensError::FactoredMatrix(format!(
                "unsqueeze({dim}) must address a leading dimension (at most {})",
                self.leading().len()
            )));
        }
        Self::new(self.a.unsqueeze(dim)?, self.b.unsqueeze(dim)?)
    }

    /// Select index `i` of the first leading dimension.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::FactoredMatrix`] without leading dimensions and
    /// [`LensError::Model`] for an out-of-range index.
    pub fn index(&self, i: usize) -> Result<Self> {
        if self.leading().is_empty() {
            return Err(LensError::FactoredMatrix(
                "index needs a leading dimension".into(),
            ));
        }
        Self::new(self.a.i(i)?, self.b.i(i)?)
    }

    /// Top-left `k × k` corner of `AB` (clipped to the matrix size).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn get_corner(&self, k: usize) -> Result<Tensor> {
        let rank = self.a.rank();
        let a = self.a.narrow(rank - 2, 0, k.min(self.ldim))?;
        let b = self.b.narrow(rank - 1, 0, k.min(self.rdim))?;
        Ok(a.matmul(&b.contiguous()?)?)
    }

    // --- Spectral quantities ----------------------------------------------

    fn svd(&self) -> Result<&Svd> {
        if let Some(svd) = self.svd.get() {
            return Ok(svd);
        }
        let computed = self.compute_svd()?;
        Ok(self.svd.get_or_init(|| computed))
    }

    /// Left singular vectors `U: [..., ldim, k]`, `k = min(ldim, mdim, rdim)`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn u(&self) -> Result<Tensor> {
        Ok(self.svd()?.u.clone())
    }

    /// Singular values `S: [..., k]`, descending.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn s(&self) -> Result<Tensor> {
        Ok(self.svd()?.s.clone())
    }

    /// Right singular vectors `V: [..., rdim, k]` (so `AB = U diag(S) Vᵀ`).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn v(&self) -> Result<Tensor> {
        Ok(self.svd()?.v.clone())
    }

    /// Frobenius norm of `AB`, via the singular values: `[...]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn norm(&self) -> Result<Tensor> {
        let s = self.s()?;
        let last = s.rank() - 1;
        Ok(s.sqr()?.sum(last)?.sqrt()?)
    }

    /// `diag(S) Vᵀ`: `[..., k, rdim]`, so that `AB = U @ collapse_l()`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn collapse_l(&self) -> Result<Tensor> {
        let svd = self.svd()?;
        let rank = svd.v.rank();
        let v_t = svd.v.transpose(rank - 2, rank - 1)?;
        Ok(v_t.broadcast_mul(&svd.s.unsqueeze(rank - 1)?)?.contiguous()?)
    }

    /// `U diag(S)`: `[..., ldim, k]`, so that `AB = collapse_r() @ Vᵀ`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn collapse_r(&self) -> Result<Tensor> {
        let svd = self.svd()?;
        let rank = svd.u.rank();
        Ok(svd.u.broadcast_mul(&svd.s.unsqueeze(rank - 2)?)?)
    }

    /// Equivalent factorisation `(U √S, √S Vᵀ)` with balanced halves.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn make_even(&self) -> Result<Self> {
        let svd = self.svd()?;
        let rank = svd.u.rank();
        let root = svd.s.sqrt()?;
        let a = svd.u.broadcast_mul(&root.unsqueeze(rank - 2)?)?;
        let v_t = svd.v.transpose(rank - 2, rank - 1)?;
        let b = v_t.broadcast_mul(&root.unsqueeze(rank - 1)?)?.contiguous()?;
        Self::new(a, b)
    }

    /// Eigenvalues of `BA`, which are the nonzero eigenvalues of `AB`.
    ///
    /// Returns `(real, imaginary)` parts, each `[..., mdim]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::FactoredMatrix`] unless `ldim == rdim`.
    pub fn eigenvalues(&self) -> Result<(Tensor, Tensor)> {
        let ba = self.ba()?;
        let m = self.mdim;
        let data = to_f64_vec(&ba)?;
        let mut re = Vec::with_capacity(data.len() / m.max(1));
        let mut im = Vec::with_capacity(re.capacity());
        // An empty inner dimension has no eigenvalues.
        if m > 0 {
            for chunk in data.chunks_exact(m * m) {
                let mat = DMatrix::from_row_slice(m, m, chunk);
                for ev in mat.complex_eigenvalues().iter() {
                    re.push(ev.re);
                    im.push(ev.im);
                }
            }
        }
        let mut shape = self.leading().to_vec();
        shape.push(m);
        let device = self.a.device();
        let dtype = self.a.dtype();
        Ok((
            from_f64(re, &shape, device, dtype)?,
            from_f64(im, &shape, device, dtype)?,
        ))
    }

    /// SVD exploiting the factorisation.
    ///
    /// With `A = Ua Sa Vaᵀ` and `B = Ub Sb Vbᵀ`, the middle matrix
    /// `Sa Vaᵀ Ub Sb` is at most `mdim × mdim`; its SVD `Um Sm Vmᵀ` gives
    /// `AB = (Ua Um) Sm (Vb Vm)ᵀ`.
    fn compute_svd(&self) -> Result<Svd> {
        let (l, m, r) = (self.ldim, self.mdim, self.rdim);
        let a = to_f64_vec(&self.a)?;
        let b = to_f64_vec(&self.b)?;
        let k = l.min(m).min(r);
        let count = self.leading().iter().product::<usize>();

        let mut u_out = Vec::with_capacity(count * l * k);
        let mut s_out = Vec::with_capacity(count * k);
        let mut v_out = Vec::with_capacity(count * r * k);

        for idx in 0..count {
            let a_i = DMatrix::from_row_slice(l, m, &a[idx * l * m..(idx + 1) * l * m]);
            let b_i = DMatrix::from_row_slice(m, r, &b[idx * m * r..(idx + 1) * m * r]);

            let (ua, sa, va_t) = thin_svd(a_i)?;
            let (ub, sb, vb_t) = thin_svd(b_i)?;

            let mut middle = va_t * ub;
            for (row, s) in sa.iter().enumerate() {
                middle.row_mut(row).scale_mut(*s);
            }
            for (col, s) in sb.iter().enumerate() {
                middle.column_mut(col).scale_mut(*s);
            }
            let (um, sm, vm_t) = thin_svd(middle)?;

            let u = (ua * um).columns(0, k).into_owned();
            let v = (vb_t.transpose() * vm_t.transpose()).columns(0, k).into_owned();
            // nalgebra is column-major; emit row-major.
            for row in 0..l {
                u_out.extend(u.row(row).iter());
            }
            s_out.extend(sm.iter().take(k));
            for row in 0..r {
                v_out.extend(v.row(row).iter());
            }
        }

        let lead = self.leading().to_vec();
        let device = self.a.device();
        let dtype = self.a.dtype();
        let shape_u = [lead.as_slice(), &[l, k]].concat();
        let shape_s = [lead.as_slice(), &[k]].concat();
        let shape_v = [lead.as_slice(), &[r, k]].concat();
        Ok(Svd {
            u: from_f64(u_out, &shape_u, device, dtype)?,
            s: from_f64(s_out, &shape_s, device, dtype)?,
            v: from_f64(v_out, &shape_v, device, dtype)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Thin SVD with singular values sorted in descending order.
fn thin_svd(mat: DMatrix<f64>) -> Result<(DMatrix<f64>, Vec<f64>, DMatrix<f64>)> {
    let svd = mat.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| LensError::FactoredMatrix("SVD did not produce U".into()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| LensError::FactoredMatrix("SVD did not produce Vᵀ".into()))?;
    let values: Vec<f64> = svd.singular_values.iter().copied().collect();

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[j].total_cmp(&values[i]));

    let u = u.select_columns(order.iter());
    let v_t = v_t.select_rows(order.iter());
    let values = order.iter().map(|&i| values[i]).collect();
    Ok((u, values, v_t))
}

fn check_dim(found: usize, expected: usize, what: &str) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(LensError::FactoredMatrix(format!(
            "{what} has dimension {found}, expected {expected}"
        )))
    }
}

/// Right-aligned broadcast of two leading shapes.
fn broadcast_leading(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let n = a.len().max(b.len());
    let pad = |s: &[usize]| {
        let mut v = vec![1; n - s.len()];
        v.extend_from_slice(s);
        v
    };
    let (a, b) = (pad(a), pad(b));
    a.iter()
        .zip(&b)
        .map(|(&x, &y)| match (x, y) {
            _ if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            _ => Err(LensError::FactoredMatrix(format!(
                "leading dimensions {a:?} and {b:?} do not broadcast"
            ))),
        })
        .collect()
}

fn broadcast_to(t: Tensor, lead: &[usize], rows: usize, cols: usize) -> Result<Tensor> {
    let target = [lead, &[rows, cols]].concat();
    if t.dims() == target.as_slice() {
        return Ok(t);
    }
    Ok(t.broadcast_as(target)?.contiguous()?)
}

fn to_f64_vec(t: &Tensor) -> Result<Vec<f64>> {
    Ok(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
}

fn from_f64(data: Vec<f64>, shape: &[usize], device: &Device, dtype: DType) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
