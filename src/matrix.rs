use crate::error::{Error, Result};

use itertools::multizip;
use rand::distributions::Distribution;
use rand::Rng;
use rand_distr::StandardNormal;
use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;

/// A dense, row-major matrix of `f64`.
///
/// Shapes are fixed at construction. Every binary operation checks shapes
/// first and returns a fresh matrix, so no two matrices ever share storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMat")]
pub struct Mat {
    rows: usize,
    cols: usize,
    data: Vec<f64>, // row-major array
}

/// Wire form of `Mat`, checked before it becomes one.
#[derive(Deserialize)]
struct RawMat {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl TryFrom<RawMat> for Mat {
    type Error = Error;

    fn try_from(raw: RawMat) -> Result<Self> {
        if raw.rows.checked_mul(raw.cols) != Some(raw.data.len()) {
            return Err(Error::Shape(format!(
                "{}x{} matrix carries {} entries",
                raw.rows,
                raw.cols,
                raw.data.len()
            )));
        }
        Ok(Mat {
            rows: raw.rows,
            cols: raw.cols,
            data: raw.data,
        })
    }
}

impl Mat {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Mat {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut mat = Mat::zeros(size, size);
        for i in 0..size {
            mat.data[i * size + i] = 1.0;
        }
        mat
    }

    /// Builds a matrix from literal rows. Ragged rows are rejected.
    pub fn from_rows<R>(rows: &[R]) -> Result<Self>
    where
        R: AsRef<[f64]>,
    {
        let cols = rows.first().map_or(0, |row| row.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(Error::dimension(
                    "from_rows",
                    (1, cols),
                    (1, row.len()),
                ));
            }
            data.extend_from_slice(row);
        }
        Ok(Mat {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Wraps `values` as an `n x 1` column vector.
    pub fn column(values: &[f64]) -> Self {
        Mat {
            rows: values.len(),
            cols: 1,
            data: values.to_vec(),
        }
    }

    pub fn random<D, R>(distribution: D, rows: usize, cols: usize, rng: &mut R) -> Self
    where
        D: Distribution<f64>,
        R: Rng + ?Sized,
    {
        let data = distribution
            .sample_iter(rng)
            .take(rows * cols)
            .collect();
        Mat { rows, cols, data }
    }

    /// Normal entries with the Xavier standard deviation `sqrt(2 / (rows + cols))`.
    pub fn xavier<R>(rows: usize, cols: usize, rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
    {
        let std_dev = (2.0 / (rows + cols) as f64).sqrt();
        let mut mat = Mat::random(StandardNormal, rows, cols, rng);
        for x in &mut mat.data {
            *x *= std_dev;
        }
        mat
    }

    /// Returns a copy with `value` added to every diagonal entry.
    pub fn offset_diagonal(&self, value: f64) -> Mat {
        let mut out = self.clone();
        for i in 0..self.rows.min(self.cols) {
            out.data[i * self.cols + i] += value;
        }
        out
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Matrix product `self * other`.
    pub fn multiply(&self, other: &Mat) -> Result<Mat> {
        if self.cols != other.rows {
            return Err(Error::dimension(
                "multiply",
                (self.cols, other.cols),
                other.shape(),
            ));
        }
        let mut out = Mat::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for j in 0..other.cols {
                let mut sum = 0.0;
                for k in 0..self.cols {
                    sum += self.data[i * self.cols + k]
                        * other.data[k * other.cols + j];
                }
                out.data[i * other.cols + j] = sum;
            }
        }
        Ok(out)
    }

    pub fn transpose(&self) -> Mat {
        let mut out = Mat::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }
        out
    }

    /// Elementwise product.
    pub fn hadamard(&self, other: &Mat) -> Result<Mat> {
        self.zip_with("hadamard", other, |l, r| l * r)
    }

    pub fn add(&self, other: &Mat) -> Result<Mat> {
        self.zip_with("add", other, |l, r| l + r)
    }

    pub fn subtract(&self, other: &Mat) -> Result<Mat> {
        self.zip_with("subtract", other, |l, r| l - r)
    }

    pub fn scale(&self, factor: f64) -> Mat {
        self.map(|x| x * factor)
    }

    pub fn map<F>(&self, f: F) -> Mat
    where
        F: Fn(f64) -> f64,
    {
        Mat {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    pub fn frobenius_norm(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    fn zip_with<F>(&self, op: &'static str, other: &Mat, f: F) -> Result<Mat>
    where
        F: Fn(f64, f64) -> f64,
    {
        if self.shape() != other.shape() {
            return Err(Error::dimension(op, self.shape(), other.shape()));
        }
        let mut out = Mat::zeros(self.rows, self.cols);
        for (o, &l, &r) in
            multizip((out.data.iter_mut(), self.data.iter(), other.data.iter()))
        {
            *o = f(l, r);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mat(rows: &[&[f64]]) -> Mat {
        Mat::from_rows(rows).unwrap()
    }

    fn arb_mat(rows: usize, cols: usize) -> impl Strategy<Value = Mat> {
        prop::collection::vec(-100.0f64..100.0, rows * cols)
            .prop_map(move |data| Mat { rows, cols, data })
    }

    #[test]
    fn multiply_known_product() {
        let a = mat(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let b = mat(&[&[5.0], &[6.0]]);
        assert_eq!(a.multiply(&b).unwrap(), mat(&[&[17.0], &[39.0]]));
    }

    #[test]
    fn multiply_rejects_incompatible_shapes() {
        let a = Mat::zeros(2, 3);
        let b = Mat::zeros(2, 3);
        match a.multiply(&b) {
            Err(Error::Dimension { op, .. }) => assert_eq!(op, "multiply"),
            other => panic!("expected dimension error, got {:?}", other),
        }
    }

    #[test]
    fn elementwise_ops_reject_shape_mismatch() {
        let a = Mat::zeros(2, 2);
        let b = Mat::zeros(2, 1);
        assert!(a.hadamard(&b).is_err());
        assert!(a.add(&b).is_err());
        assert!(a.subtract(&b).is_err());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let rows: [&[f64]; 2] = [&[1.0, 2.0], &[3.0]];
        assert!(Mat::from_rows(&rows).is_err());
    }

    #[test]
    fn elementwise_ops() {
        let a = mat(&[&[1.0, -2.0], &[3.0, 4.0]]);
        let b = mat(&[&[2.0, 2.0], &[0.5, -1.0]]);
        assert_eq!(a.hadamard(&b).unwrap(), mat(&[&[2.0, -4.0], &[1.5, -4.0]]));
        assert_eq!(a.add(&b).unwrap(), mat(&[&[3.0, 0.0], &[3.5, 3.0]]));
        assert_eq!(a.subtract(&b).unwrap(), mat(&[&[-1.0, -4.0], &[2.5, 5.0]]));
        assert_eq!(a.scale(2.0), mat(&[&[2.0, -4.0], &[6.0, 8.0]]));
    }

    #[test]
    fn frobenius_norm_of_known_matrix() {
        let a = mat(&[&[3.0, 0.0], &[0.0, 4.0]]);
        assert_eq!(a.frobenius_norm(), 5.0);
    }

    #[test]
    fn identity_is_neutral() {
        let a = mat(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
        assert_eq!(Mat::identity(2).multiply(&a).unwrap(), a);
        assert_eq!(a.multiply(&Mat::identity(3)).unwrap(), a);
    }

    #[test]
    fn deserialize_rejects_short_buffer() {
        let ok: Mat = serde_json::from_str(r#"{"rows":1,"cols":2,"data":[1.0,2.0]}"#).unwrap();
        assert_eq!(ok, mat(&[&[1.0, 2.0]]));
        assert!(serde_json::from_str::<Mat>(r#"{"rows":1,"cols":2,"data":[1.0]}"#).is_err());
        assert!(serde_json::from_str::<Mat>(r#"{"rows":2,"cols":2,"data":[1.0,2.0,3.0,4.0,5.0]}"#).is_err());
    }

    #[test]
    fn transpose_swaps_shape() {
        let a = mat(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
        let t = a.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.get(2, 0), 3.0);
        assert_eq!(t.get(0, 1), 4.0);
    }

    proptest! {
        #[test]
        fn multiply_shape(r in 1usize..6, c in 1usize..6, k in 1usize..6, seed in any::<u64>()) {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let a = Mat::xavier(r, c, &mut rng);
            let b = Mat::xavier(c, k, &mut rng);
            prop_assert_eq!(a.multiply(&b).unwrap().shape(), (r, k));
        }

        #[test]
        fn transpose_is_an_involution(a in (1usize..6, 1usize..6).prop_flat_map(|(r, c)| arb_mat(r, c))) {
            prop_assert_eq!(a.transpose().transpose(), a);
        }

        #[test]
        fn frobenius_norm_is_non_negative(a in arb_mat(3, 4)) {
            prop_assert!(a.frobenius_norm() >= 0.0);
        }
    }
}
