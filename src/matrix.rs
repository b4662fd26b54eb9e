//! Dense row-major matrices and the reference product

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{GemmError, GemmResult};
use crate::ops::{Element, MapOperator, ReduceOperator};

/// A dense matrix in row-major layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Element> Matrix<T> {
    pub fn new(rows: usize, cols: usize, data: Vec<T>) -> GemmResult<Self> {
        let len = rows.checked_mul(cols).ok_or_else(|| {
            GemmError::invalid_config(format!("a {}x{} matrix is too large", rows, cols))
        })?;
        if data.len() != len {
            return Err(GemmError::shape(
                format!("{}x{} matrix", rows, cols),
                len,
                data.len(),
            ));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Build from nested rows, e.g. `[[1, 2], [3, 4]]`.
    pub fn from_rows(rows: &[Vec<T>]) -> GemmResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|row| row.len() != cols) {
            return Err(GemmError::shape("matrix row", cols, bad.len()));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.iter().flatten().copied().collect(),
        })
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

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[T] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

impl<T: Element + DeserializeOwned> Matrix<T> {
    /// Deserialize a matrix and check that its data matches its shape.
    pub fn from_json(json: &str) -> GemmResult<Self> {
        let matrix: Self = serde_json::from_str(json)?;
        Self::new(matrix.rows, matrix.cols, matrix.data)
    }
}

impl<T: Element + Serialize> Matrix<T> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Naive triple loop under the same operator pair as the grid.
pub fn reference_product<T, M, R>(a: &Matrix<T>, b: &Matrix<T>) -> GemmResult<Matrix<T>>
where
    T: Element,
    M: MapOperator<T>,
    R: ReduceOperator<T>,
{
    if a.cols != b.rows {
        return Err(GemmError::shape("B rows", a.cols, b.rows));
    }
    let mut c = Matrix::filled(a.rows, b.cols, R::identity());
    for n in 0..a.rows {
        for m in 0..b.cols {
            let mut acc = R::identity();
            for k in 0..a.cols {
                acc = R::apply(acc, M::apply(a.get(n, k), b.get(k, m)));
            }
            c.data[n * b.cols + m] = acc;
        }
    }
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Add, Min, Multiply};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_rows() {
        let m = Matrix::from_rows(&[vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m.get(1, 0), 4);
        assert_eq!(m.row(1), &[4, 5, 6]);

        assert!(Matrix::from_rows(&[vec![1, 2], vec![3]]).is_err());
    }

    #[test]
    fn test_reference_product() {
        let a = Matrix::from_rows(&[vec![1, 2], vec![3, 4]]).unwrap();
        let b = Matrix::from_rows(&[vec![5, 6], vec![7, 8]]).unwrap();
        let c = reference_product::<i32, Multiply, Add>(&a, &b).unwrap();
        assert_eq!(c.data(), &[19, 22, 43, 50]);
    }

    #[test]
    fn test_reference_min_plus() {
        // Edge weights of a 3-node graph, i32::MAX / 4 stands in for "no edge"
        let inf = i32::MAX / 4;
        let w = Matrix::from_rows(&[vec![0, 4, 1], vec![inf, 0, inf], vec![inf, 2, 0]]).unwrap();
        let two_hops = reference_product::<i32, Add, Min>(&w, &w).unwrap();
        assert_eq!(two_hops.get(0, 1), 3);
    }

    #[test]
    fn test_json_checks_shape() {
        let ok = Matrix::<f64>::from_json(r#"{"rows": 1, "cols": 2, "data": [1.0, 2.0]}"#).unwrap();
        assert_eq!(ok.cols(), 2);
        assert!(Matrix::<f64>::from_json(r#"{"rows": 2, "cols": 2, "data": [1.0]}"#).is_err());

        let huge = format!(r#"{{"rows": {}, "cols": 4, "data": []}}"#, usize::MAX / 2);
        assert!(matches!(
            Matrix::<f64>::from_json(&huge),
            Err(GemmError::InvalidConfig { .. })
        ));
    }
}
