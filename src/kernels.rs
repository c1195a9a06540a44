/**
 * @file src/kernels.rs
 * @brief Vector and matrix kernels used by layers, losses and optimizers
 *
 * Kernels operate on plain `&[f64]` buffers so they work equally on arena
 * slices and on caller-owned vectors. Matrices are passed as row lists
 * (`&[R]` with `R: AsRef<[f64]>`), matching how dense layers store weights.
 *
 * The `*_into` variants write into a caller-provided destination and never
 * allocate; the plain variants allocate their result from an [`Arena`].
 * Every kernel checks its operand lengths before writing anything.
 *
 * Dot products use Kahan compensated summation, which keeps the
 * accumulated rounding error independent of the vector length.
 */

use crate::error::{Error, Result};
use crate::memory::{Arena, Slice};

// === ELEMENT-WISE ===

/// `dst[i] = f(src[i])`
pub fn map_into<F>(dst: &mut [f64], src: &[f64], f: F) -> Result<()>
where
    F: Fn(f64) -> f64,
{
    Error::check_len("kernels::map", dst.len(), src.len())?;
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = f(s);
    }
    Ok(())
}

/// Allocating variant of [`map_into`].
pub fn map<F>(arena: &mut Arena, src: &[f64], f: F) -> Slice
where
    F: Fn(f64) -> f64,
{
    let mut dst = arena.alloc(src.len());
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = f(s);
    }
    dst
}

/// `dst[i] = f(a[i], b[i])`
pub fn zip_map_into<F>(dst: &mut [f64], a: &[f64], b: &[f64], f: F) -> Result<()>
where
    F: Fn(f64, f64) -> f64,
{
    Error::check_len("kernels::zip_map", dst.len(), a.len())?;
    Error::check_len("kernels::zip_map", a.len(), b.len())?;
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = f(x, y);
    }
    Ok(())
}

/// Allocating variant of [`zip_map_into`].
pub fn zip_map<F>(arena: &mut Arena, a: &[f64], b: &[f64], f: F) -> Result<Slice>
where
    F: Fn(f64, f64) -> f64,
{
    Error::check_len("kernels::zip_map", a.len(), b.len())?;
    let mut dst = arena.alloc(a.len());
    zip_map_into(&mut dst, a, b, f)?;
    Ok(dst)
}

/// `dst[i] = f(dst[i], src[i])`
pub fn zip_apply<F>(dst: &mut [f64], src: &[f64], f: F) -> Result<()>
where
    F: Fn(f64, f64) -> f64,
{
    Error::check_len("kernels::zip_apply", dst.len(), src.len())?;
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = f(*d, s);
    }
    Ok(())
}

/// `dst[i] += src[i]`
pub fn add_into(dst: &mut [f64], src: &[f64]) -> Result<()> {
    zip_apply(dst, src, |d, s| d + s)
}

/// `dst[i] *= src[i]`
pub fn mul_into(dst: &mut [f64], src: &[f64]) -> Result<()> {
    zip_apply(dst, src, |d, s| d * s)
}

/// `dst[i] += scale * src[i]`
pub fn add_scaled_into(dst: &mut [f64], src: &[f64], scale: f64) -> Result<()> {
    zip_apply(dst, src, |d, s| d + scale * s)
}

/// `dst[i] *= factor`
pub fn scale_in_place(dst: &mut [f64], factor: f64) {
    dst.iter_mut().for_each(|d| *d *= factor);
}

// === REDUCTIONS ===

/// Kahan compensated accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum
    }
}

/// Compensated sum of all elements.
pub fn sum(values: &[f64]) -> f64 {
    let mut acc = KahanSum::new();
    values.iter().for_each(|&v| acc.add(v));
    acc.value()
}

/// Compensated dot product.
pub fn dot(a: &[f64], b: &[f64]) -> Result<f64> {
    Error::check_len("kernels::dot", a.len(), b.len())?;
    let mut acc = KahanSum::new();
    for (&x, &y) in a.iter().zip(b) {
        acc.add(x * y);
    }
    Ok(acc.value())
}

/// Index of the largest element; the first one wins on ties.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if v <= b => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Population mean and standard deviation over every element of every row.
pub fn mean_std<R: AsRef<[f64]>>(rows: &[R]) -> (f64, f64) {
    let count: usize = rows.iter().map(|r| r.as_ref().len()).sum();
    if count == 0 {
        return (0.0, 0.0);
    }
    let mut acc = KahanSum::new();
    rows.iter()
        .flat_map(|r| r.as_ref().iter())
        .for_each(|&v| acc.add(v));
    let mean = acc.value() / count as f64;

    let mut var = KahanSum::new();
    rows.iter().flat_map(|r| r.as_ref().iter()).for_each(|&v| {
        let d = v - mean;
        var.add(d * d);
    });
    (mean, (var.value() / count as f64).sqrt())
}

// === MATRIX ===

/// `dst = M · v` where `M` is given as rows.
pub fn mat_vec_into<R: AsRef<[f64]>>(dst: &mut [f64], rows: &[R], v: &[f64]) -> Result<()> {
    Error::check_len("kernels::mat_vec rows", rows.len(), dst.len())?;
    for row in rows {
        Error::check_len("kernels::mat_vec columns", v.len(), row.as_ref().len())?;
    }
    for (d, row) in dst.iter_mut().zip(rows) {
        *d = dot(row.as_ref(), v)?;
    }
    Ok(())
}

/// Allocating variant of [`mat_vec_into`].
pub fn mat_vec<R: AsRef<[f64]>>(arena: &mut Arena, rows: &[R], v: &[f64]) -> Result<Slice> {
    for row in rows {
        Error::check_len("kernels::mat_vec columns", v.len(), row.as_ref().len())?;
    }
    let mut dst = arena.alloc(rows.len());
    mat_vec_into(&mut dst, rows, v)?;
    Ok(dst)
}

/// `dst = Mᵀ · v` where `M` is given as rows.
pub fn mat_t_vec_into<R: AsRef<[f64]>>(dst: &mut [f64], rows: &[R], v: &[f64]) -> Result<()> {
    Error::check_len("kernels::mat_t_vec rows", rows.len(), v.len())?;
    for row in rows {
        Error::check_len("kernels::mat_t_vec columns", dst.len(), row.as_ref().len())?;
    }
    for (k, d) in dst.iter_mut().enumerate() {
        let mut acc = KahanSum::new();
        for (row, &g) in rows.iter().zip(v) {
            acc.add(row.as_ref()[k] * g);
        }
        *d = acc.value();
    }
    Ok(())
}

/// Row-wise [`mat_vec_into`] over a batch of inputs.
pub fn mat_vec_batch_into<R, D, V>(dst: &mut [D], rows: &[R], inputs: &[V]) -> Result<()>
where
    R: AsRef<[f64]>,
    D: AsMut<[f64]>,
    V: AsRef<[f64]>,
{
    Error::check_len("kernels::mat_vec_batch", dst.len(), inputs.len())?;
    for (out, input) in dst.iter_mut().zip(inputs) {
        mat_vec_into(out.as_mut(), rows, input.as_ref())?;
    }
    Ok(())
}

/// Row-wise [`map_into`] over a batch.
pub fn map_rows_into<D, S, F>(dst: &mut [D], src: &[S], f: F) -> Result<()>
where
    D: AsMut<[f64]>,
    S: AsRef<[f64]>,
    F: Fn(f64) -> f64,
{
    Error::check_len("kernels::map_rows", dst.len(), src.len())?;
    for (out, input) in dst.iter_mut().zip(src) {
        map_into(out.as_mut(), input.as_ref(), &f)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_map_and_zip_map() {
        let mut arena = Arena::default();
        let doubled = map(&mut arena, &[1.0, -2.0, 3.5], |x| x * 2.0);
        assert_eq!(doubled.as_slice(), &[2.0, -4.0, 7.0]);

        let summed = zip_map(&mut arena, &[1.0, 2.0], &[10.0, 20.0], |a, b| a + b).unwrap();
        assert_eq!(summed.as_slice(), &[11.0, 22.0]);
    }

    #[test]
    fn test_length_mismatch_is_rejected_before_writing() {
        let mut dst = [7.0; 3];
        let err = map_into(&mut dst, &[1.0, 2.0], |x| x).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2, .. }));
        assert_eq!(dst, [7.0; 3]);

        assert!(zip_map_into(&mut dst, &[1.0; 3], &[1.0; 2], |a, b| a + b).is_err());
        assert!(dot(&[1.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_dot_is_compensated() {
        let n = 10_000;
        let a = vec![0.1; n];
        let b = vec![1.0; n];
        let naive: f64 = a.iter().sum();
        let kahan = dot(&a, &b).unwrap();
        assert!((kahan - 1000.0).abs() <= (naive - 1000.0).abs());
        assert_relative_eq!(kahan, 1000.0, epsilon = 1e-10);
    }

    #[test]
    fn test_mat_vec_and_transpose() {
        let rows = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let mut out = [0.0; 2];
        mat_vec_into(&mut out, &rows, &[1.0, 0.0, -1.0]).unwrap();
        assert_eq!(out, [-2.0, -2.0]);

        let mut back = [0.0; 3];
        mat_t_vec_into(&mut back, &rows, &[1.0, 2.0]).unwrap();
        assert_eq!(back, [9.0, 12.0, 15.0]);

        assert!(mat_vec_into(&mut out, &rows, &[1.0, 2.0]).is_err());
        assert!(mat_t_vec_into(&mut back, &rows, &[1.0]).is_err());
    }

    #[test]
    fn test_mat_vec_on_arena_rows() {
        let mut arena = Arena::default();
        let rows = vec![arena.alloc_from(&[0.5, 0.5]), arena.alloc_from(&[1.0, -1.0])];
        let out = mat_vec(&mut arena, &rows, &[2.0, 4.0]).unwrap();
        assert_eq!(out.as_slice(), &[3.0, -2.0]);
    }

    #[test]
    fn test_batch_variants() {
        let rows = vec![vec![1.0, 1.0]];
        let inputs = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let mut outs = vec![vec![0.0; 1]; 2];
        mat_vec_batch_into(&mut outs, &rows, &inputs).unwrap();
        assert_eq!(outs, vec![vec![3.0], vec![7.0]]);

        let mut squared = vec![vec![0.0; 2]; 2];
        map_rows_into(&mut squared, &inputs, |x| x * x).unwrap();
        assert_eq!(squared[1], vec![9.0, 16.0]);
    }

    #[test]
    fn test_axpy_and_reductions() {
        let mut dst = [1.0, 1.0];
        add_scaled_into(&mut dst, &[2.0, -2.0], 0.5).unwrap();
        assert_eq!(dst, [2.0, 0.0]);
        scale_in_place(&mut dst, 3.0);
        assert_eq!(dst, [6.0, 0.0]);

        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[]), None);

        let (mean, std) = mean_std(&[vec![1.0, 3.0], vec![1.0, 3.0]]);
        assert_relative_eq!(mean, 2.0);
        assert_relative_eq!(std, 1.0);
        assert_relative_eq!(sum(&[1.0, 2.0, 3.0]), 6.0);
    }
}
