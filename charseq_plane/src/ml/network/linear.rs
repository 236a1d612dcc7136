use std::iter;

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ml::{layer::LayerInitStrategy, LayerValues, NodeValue, RngStrategy};

/// Dense row-major matrix of `count` rows by `stride` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    inner: LayerValues,
    stride: usize,
    count: usize,
}

impl Linear {
    pub fn new(count: usize, stride: usize) -> Self {
        Self::with_value(count, stride, 0.0)
    }

    pub fn with_dimensions(other: &Self) -> Self {
        Self::with_value(other.count, other.stride, 0.0)
    }

    pub fn with_value(count: usize, stride: usize, value: NodeValue) -> Self {
        let size = count * stride;
        Self {
            inner: LayerValues::new(vec![value; size]),
            stride,
            count,
        }
    }

    pub fn from_iter<I: Iterator<Item = NodeValue>>(stride: usize, values: I) -> Result<Self> {
        let inner: LayerValues = values.collect();
        if stride == 0 {
            Err(anyhow!("invalid zero stride dimension"))?;
        }
        let count = inner.len() / stride;

        if inner.len() != stride * count {
            Err(anyhow!("mismatched values length/stride"))?;
        }

        Ok(Self {
            inner,
            stride,
            count,
        })
    }

    pub fn from_row(row: &[NodeValue]) -> Self {
        Self {
            inner: row.into(),
            stride: row.len(),
            count: 1,
        }
    }

    pub fn initialize_as_layer(&mut self, strategy: &LayerInitStrategy, rng: &RngStrategy) {
        strategy.apply(
            self.inner.iter_mut(),
            iter::empty(),
            self.count,
            self.stride,
            rng,
        );
    }

    pub fn initialize_as_layer_bias(&mut self, strategy: &LayerInitStrategy, rng: &RngStrategy) {
        strategy.apply(
            iter::empty(),
            self.inner.iter_mut(),
            self.count,
            self.stride,
            rng,
        );
    }

    pub fn iter<'a>(&'a self) -> LinearIter<'a, impl Iterator<Item = NodeValue> + 'a> {
        LinearIter {
            inner: self.inner.iter().copied(),
            stride: self.stride,
            count: self.count,
            parent: Some(self),
        }
    }

    pub fn iter_transpose<'a>(&'a self) -> LinearIter<'a, impl Iterator<Item = NodeValue> + 'a> {
        let stride = self.stride;
        let count = self.count;

        let x = (0..self.inner.len()).map(move |idx| {
            let (i, j) = (idx / count, idx % count);
            self.inner[i + j * stride]
        });
        LinearIter {
            inner: x,
            stride: count,
            count: stride,
            parent: None,
        }
    }

    /// Joins columns of `self` and `rhs` row by row.
    pub fn concat<'a>(&'a self, rhs: &'a Linear) -> BoxedLinearIter<'a> {
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        let self_items = self.inner.chunks_exact(self.stride);
        let rhs_items = rhs.inner.chunks_exact(rhs.stride);
        LinearIter {
            inner: Box::new(
                self_items
                    .zip(rhs_items)
                    .flat_map(|(lhs, rhs)| lhs.iter().chain(rhs).copied()),
            ),
            stride: self.stride + rhs.stride,
            count: self.count,
            parent: None,
        }
    }

    /// Splits columns into `n` equally sized blocks.
    pub fn split(&self, n: usize) -> Vec<Self> {
        assert_eq!(self.stride % n, 0, "mismatched dimensions");
        let stride = self.stride / n;
        (0..n)
            .map(|i| Self {
                inner: self
                    .inner
                    .chunks_exact(self.stride)
                    .flat_map(|row| row.iter().skip(i * stride).take(stride))
                    .copied()
                    .collect(),
                stride,
                count: self.count,
            })
            .collect()
    }

    /// returns `self * rhs`
    pub fn matrix_product(&self, rhs: &Linear) -> Linear {
        assert_eq!(self.stride, rhs.count, "mismatched dimensions");
        let stride = rhs.stride;
        let mut inner = vec![0.0; self.count * stride];

        for (c_row, a_row) in inner
            .chunks_exact_mut(stride)
            .zip(self.inner.chunks_exact(self.stride))
        {
            for (&a, b_row) in a_row.iter().zip(rhs.inner.chunks_exact(stride)) {
                if a == 0.0 {
                    continue;
                }
                for (c, &b) in c_row.iter_mut().zip(b_row) {
                    *c = a.mul_add(b, *c);
                }
            }
        }

        Linear {
            inner: LayerValues::new(inner),
            stride,
            count: self.count,
        }
    }

    /// returns `self * rhs.T`
    pub fn matrix_product_rhs_transposed(&self, rhs: &Linear) -> Linear {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");

        let inner = self
            .rows_iter()
            .flat_map(|a| {
                rhs.rows_iter().map(move |b| {
                    a.iter()
                        .zip(b)
                        .fold(0.0, |sum: NodeValue, (a, b)| a.mul_add(*b, sum))
                })
            })
            .collect();

        Linear {
            inner,
            stride: rhs.count,
            count: self.count,
        }
    }

    /// returns `self.T * rhs`
    pub fn matrix_product_lhs_transposed(&self, rhs: &Linear) -> Linear {
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        let stride = rhs.stride;
        let mut inner = vec![0.0; self.stride * stride];

        for (a_row, b_row) in self.rows_iter().zip(rhs.rows_iter()) {
            for (&a, c_row) in a_row.iter().zip(inner.chunks_exact_mut(stride)) {
                if a == 0.0 {
                    continue;
                }
                for (c, &b) in c_row.iter_mut().zip(b_row) {
                    *c = a.mul_add(b, *c);
                }
            }
        }

        Linear {
            inner: LayerValues::new(inner),
            stride,
            count: self.stride,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_finite(&self) -> bool {
        self.inner.iter().all(|x| x.is_finite())
    }

    /// row-major view of every element
    pub fn as_slice(&self) -> &[NodeValue] {
        &self.inner
    }

    pub fn row(&self, idx: usize) -> Option<&[NodeValue]> {
        self.rows_iter().nth(idx)
    }

    pub fn rows_iter(&self) -> impl Iterator<Item = &[NodeValue]> {
        self.inner.chunks_exact(self.stride)
    }

    pub fn rows_iter_mut(&mut self) -> impl Iterator<Item = &mut [NodeValue]> {
        self.inner.chunks_exact_mut(self.stride)
    }

    /// yields `(value, column, row)`
    pub fn values_iter(&self) -> impl Iterator<Item = (&NodeValue, usize, usize)> {
        self.inner
            .iter()
            .enumerate()
            .map(|(idx, x)| (x, idx % self.stride, idx / self.stride))
    }

    pub fn as_scalar(&self) -> Result<NodeValue> {
        if self.inner.len() == 1 {
            Ok(self.inner[0])
        } else {
            Err(anyhow!(
                "can not read value of shape = [{}, {}] as scalar",
                self.count,
                self.stride
            ))
        }
    }

    pub fn copy_stride_into(&mut self, src: &[NodeValue], dest_row_idx: usize) {
        assert_eq!(self.stride, src.len(), "Mismatched stride dimension");
        assert!(self.count > dest_row_idx, "Invalid destination row index");
        let start = dest_row_idx * self.stride;
        let end = start + self.stride;
        self.inner[start..end].copy_from_slice(src);
    }

    pub fn as_single_stride(&self) -> Result<LayerValues> {
        if self.count == 1 {
            Ok(self.inner[..self.stride].into())
        } else {
            Err(anyhow!(
                "can not read shape = [{}, {}] as single stride",
                self.count,
                self.stride
            ))
        }
    }

    pub fn to_sum(&self) -> NodeValue {
        self.inner.iter().sum()
    }
}

impl std::fmt::Display for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.rows_iter()
            .fold(&mut f.debug_list(), |list, row| list.entry(&row))
            .finish()
    }
}

impl std::str::FromStr for Linear {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lines = s
            .lines()
            .filter_map(|x| Some(x.trim()).filter(|x| !x.is_empty()))
            .collect_vec();

        let count = lines.len();
        if count == 0 {
            return Err(anyhow!("no rows found"));
        }
        let elements: Result<Vec<NodeValue>, _> = lines
            .into_iter()
            .flat_map(|line| line.split_whitespace().map(|x| x.parse::<NodeValue>()))
            .collect();

        let elements = elements.context("invalid numerical found")?;
        let stride = elements.len() / count;

        if stride * count == elements.len() {
            Linear::from_iter(stride, elements.into_iter())
        } else {
            Err(anyhow!("mismatch row length found"))
        }
    }
}

impl Default for Linear {
    fn default() -> Self {
        Self {
            inner: LayerValues::new(vec![0.0]),
            stride: 1,
            count: 1,
        }
    }
}

pub type BoxedLinearIter<'a> = LinearIter<'a, Box<dyn Iterator<Item = NodeValue> + 'a>>;

#[must_use = "linear iterators are lazy and do nothing unless consumed"]
pub struct LinearIter<'a, I> {
    inner: I,
    stride: usize,
    count: usize,
    parent: Option<&'a Linear>,
}

impl<'a, I> LinearIter<'a, I>
where
    I: Iterator<Item = NodeValue> + 'a,
{
    /// returns underlying data stride dimension size (or 'width')
    pub fn stride(&self) -> usize {
        self.stride
    }
    /// returns underlying data count dimension size (or 'height')
    pub fn count(&self) -> usize {
        self.count
    }
    pub fn boxed(self) -> BoxedLinearIter<'a> {
        LinearIter {
            inner: Box::new(self.inner),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise division
    pub fn div(
        self,
        rhs: LinearIter<'a, impl Iterator<Item = NodeValue>>,
        epsilon: Option<NodeValue>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        let e = epsilon.unwrap_or(0.0);
        LinearIter {
            inner: self.inner.zip(rhs.inner).map(move |(x, y)| x / (y + e)),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise addition
    pub fn add(
        self,
        other: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, other.stride, "mismatched stride dimension");
        assert_eq!(self.count, other.count, "mismatched count dimension");
        LinearIter {
            inner: self.inner.zip(other.inner).map(|(x, y)| x + y),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise subtraction
    pub fn sub(
        self,
        rhs: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        LinearIter {
            inner: self.inner.zip(rhs.inner).map(|(x, y)| x - y),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise multiplication by scalar constant
    pub fn multiply_scalar(
        self,
        rhs: NodeValue,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x * rhs),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise raise to the power of scalar floating point constant
    pub fn powf_scalar(self, n: NodeValue) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x.powf(n)),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise round to fixed point decimal
    pub fn round(self, decimals: u32) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        let mul = 10u32.pow(decimals) as NodeValue;
        LinearIter {
            inner: self.inner.map(move |x| (x * mul).round() / mul),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise absolute value computation
    pub fn abs(self) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(|x| x.abs()),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise application of an arbitrary function
    pub fn map<F: Fn(NodeValue) -> NodeValue + 'a>(
        self,
        func: F,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(func),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// extends count dimension by copying duplicating row values
    /// Note: count dimension must be equal to 1
    pub fn stack(self, count: usize) -> BoxedLinearIter<'a> {
        assert_eq!(self.count, 1, "can only stack when count dimension = 1");
        assert_ne!(count, 0, "invalid count dimension");
        LinearIter {
            inner: match self.parent {
                Some(parent) => Box::new(
                    parent
                        .inner
                        .iter()
                        .copied()
                        .cycle()
                        .take(self.stride * count),
                ),
                None => Box::new(
                    self.inner
                        .collect_vec()
                        .into_iter()
                        .cycle()
                        .take(self.stride * count),
                ),
            },
            stride: self.stride,
            count,
            parent: None,
        }
    }
    pub fn apply_gradients(
        self,
        grads: LinearIter<'a, impl Iterator<Item = NodeValue>>,
        learn_rate: NodeValue,
    ) -> Linear {
        self.sub(grads.multiply_scalar(learn_rate)).collect()
    }
    pub fn flatten_sum(self) -> Linear {
        Linear {
            inner: self
                .inner
                .chunks(self.stride)
                .into_iter()
                .map(|x| x.sum::<NodeValue>())
                .collect(),
            stride: 1,
            count: self.count,
        }
    }
    pub fn flatten_mean(self) -> Linear {
        let stride = self.stride as NodeValue;
        Linear {
            inner: self
                .inner
                .chunks(self.stride)
                .into_iter()
                .map(|x| x.sum::<NodeValue>() / stride)
                .collect(),
            stride: 1,
            count: self.count,
        }
    }
    pub fn collect(self) -> Linear {
        Linear {
            inner: self.inner.collect(),
            stride: self.stride,
            count: self.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_multiply_matrices() {
        let a: Linear = "1 2 3\n4 5 6".parse().unwrap();
        let b: Linear = "7 8\n9 10\n11 12".parse().unwrap();

        let expected: Linear = "58 64\n139 154".parse().unwrap();
        assert_eq!(expected, a.matrix_product(&b));
    }

    #[test]
    fn transposed_products_agree_with_plain_product() {
        let rng = RngStrategy::testable(12345);
        let mut a = Linear::new(5, 3);
        let mut b = Linear::new(3, 7);
        a.initialize_as_layer(&LayerInitStrategy::Kaiming, &rng);
        b.initialize_as_layer(&LayerInitStrategy::Kaiming, &rng);

        let expected = a.matrix_product(&b);

        let b_transposed = b.iter_transpose().collect();
        let rhs_transposed = a.matrix_product_rhs_transposed(&b_transposed);
        let a_transposed = a.iter_transpose().collect();
        let lhs_transposed = a_transposed.matrix_product_lhs_transposed(&b);

        let delta = |x: &Linear| {
            expected
                .iter()
                .sub(x.iter())
                .round(10)
                .collect()
        };
        assert_eq!(Linear::with_dimensions(&expected), delta(&rhs_transposed));
        assert_eq!(Linear::with_dimensions(&expected), delta(&lhs_transposed));
    }

    #[test]
    fn can_transpose() {
        let a: Linear = "1 2 3\n4 5 6".parse().unwrap();
        let expected: Linear = "1 4\n2 5\n3 6".parse().unwrap();
        assert_eq!(expected, a.iter_transpose().collect());
        assert_eq!(a, a.iter_transpose().collect().iter_transpose().collect());
    }

    #[test]
    fn can_split_and_concat_columns() {
        let x: Linear = "1 2 3 4 5 6\n7 8 9 10 11 12".parse().unwrap();
        let split = x.split(3);

        assert_eq!(3, split.len());
        assert_eq!("3 4\n9 10".parse::<Linear>().unwrap(), split[1]);

        let joined = split[0].concat(&split[1]).collect();
        let joined = joined.concat(&split[2]).collect();
        assert_eq!(x, joined);
    }

    #[test]
    fn can_stack_and_flatten() {
        let bias: Linear = "1 2 3".parse().unwrap();
        let stacked = bias.iter().stack(2).collect();
        assert_eq!("1 2 3\n1 2 3".parse::<Linear>().unwrap(), stacked);

        let column_sums = stacked.iter_transpose().flatten_sum();
        assert_eq!("2\n4\n6".parse::<Linear>().unwrap(), column_sums);

        let row_means = stacked.iter().flatten_mean();
        assert_eq!("2\n2".parse::<Linear>().unwrap(), row_means);
    }

    #[test]
    fn rejects_ragged_rows() {
        assert!("1 2\n3".parse::<Linear>().is_err());
        assert!("".parse::<Linear>().is_err());
        assert!(Linear::from_iter(3, [1.0, 2.0].into_iter()).is_err());
    }
}
