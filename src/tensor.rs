//! Tensor backend contract. See spec §6.
//!
//! The protocol engine is generic over a tensor type satisfying [`Tensor`]:
//! an opaque n-dimensional floating array supporting elementwise add/sub,
//! scalar division, user-supplied binary kernels, and Gaussian sampling from
//! either a seeded or an unseeded generator. A real deployment would plug in
//! a production numerics library here (the concrete backend is explicitly
//! out of scope, spec §1); [`NdTensor`] is the reference implementation used
//! by this crate's tests and demo, backed by `ndarray`.

use ndarray::ArrayD;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Sub};

/// The tensor contract the protocol engine requires of its numerics backend.
pub trait Tensor:
    Clone
    + Send
    + Add<Output = Self>
    + Sub<Output = Self>
    + Div<f64, Output = Self>
    + Serialize
    + for<'de> Deserialize<'de>
{
    /// The tensor's shape.
    fn shape(&self) -> Vec<usize>;

    /// Draw a tensor of the given `shape` from `N(mean, std)` using `rng`.
    fn normal(mean: f64, std: f64, shape: &[usize], rng: &mut impl Rng) -> Self;
}

/// Reference `Tensor` implementation: an `f64` array of runtime-known shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdTensor(pub ArrayD<f64>);

impl NdTensor {
    /// Wrap an existing `ndarray` value.
    pub fn new(array: ArrayD<f64>) -> Self {
        NdTensor(array)
    }

    /// Build from a flat slice and shape.
    pub fn from_shape_vec(shape: &[usize], data: Vec<f64>) -> Self {
        NdTensor(ArrayD::from_shape_vec(shape.to_vec(), data).expect("shape/data length mismatch"))
    }

    /// Apply a user-supplied elementwise/bilinear kernel `f(self, other)`.
    pub fn apply(&self, other: &NdTensor, f: impl Fn(&ArrayD<f64>, &ArrayD<f64>) -> ArrayD<f64>) -> NdTensor {
        NdTensor(f(&self.0, &other.0))
    }

    /// A kernel performing elementwise addition — the canonical `linear` function.
    pub fn add_kernel(a: &NdTensor, b: &NdTensor) -> NdTensor {
        NdTensor(&a.0 + &b.0)
    }

    /// A kernel performing elementwise subtraction.
    pub fn sub_kernel(a: &NdTensor, b: &NdTensor) -> NdTensor {
        NdTensor(&a.0 - &b.0)
    }

    /// A bilinear kernel performing elementwise multiplication.
    pub fn mul_kernel(a: &NdTensor, b: &NdTensor) -> NdTensor {
        NdTensor(&a.0 * &b.0)
    }
}

impl Add for NdTensor {
    type Output = NdTensor;
    fn add(self, rhs: NdTensor) -> NdTensor {
        NdTensor(self.0 + rhs.0)
    }
}

impl Sub for NdTensor {
    type Output = NdTensor;
    fn sub(self, rhs: NdTensor) -> NdTensor {
        NdTensor(self.0 - rhs.0)
    }
}

impl Div<f64> for NdTensor {
    type Output = NdTensor;
    fn div(self, rhs: f64) -> NdTensor {
        NdTensor(self.0 / rhs)
    }
}

impl Tensor for NdTensor {
    fn shape(&self) -> Vec<usize> {
        self.0.shape().to_vec()
    }

    fn normal(mean: f64, std: f64, shape: &[usize], rng: &mut impl Rng) -> Self {
        let dist = Normal::new(mean, std).expect("std must be finite and non-negative");
        let len: usize = shape.iter().product();
        let data: Vec<f64> = (0..len).map(|_| dist.sample(rng)).collect();
        NdTensor::from_shape_vec(shape, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn normal_respects_shape() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let t = NdTensor::normal(0.0, 5.0, &[2, 3], &mut rng);
        assert_eq!(t.shape(), vec![2, 3]);
    }

    #[test]
    fn same_seed_gives_same_draws() {
        let mut rng_a = ChaCha20Rng::seed_from_u64(42);
        let mut rng_b = ChaCha20Rng::seed_from_u64(42);
        let a = NdTensor::normal(0.0, 1.0, &[4], &mut rng_a);
        let b = NdTensor::normal(0.0, 1.0, &[4], &mut rng_b);
        assert_eq!(a, b);
    }

    #[test]
    fn add_sub_div_are_elementwise() {
        let a = NdTensor::from_shape_vec(&[3], vec![1.0, 2.0, 3.0]);
        let b = NdTensor::from_shape_vec(&[3], vec![10.0, 20.0, 30.0]);
        let sum = a.clone() + b.clone();
        assert_eq!(sum.0.as_slice().unwrap(), &[11.0, 22.0, 33.0]);
        let diff = b.clone() - a;
        assert_eq!(diff.0.as_slice().unwrap(), &[9.0, 18.0, 27.0]);
        let halved = b / 2.0;
        assert_eq!(halved.0.as_slice().unwrap(), &[5.0, 10.0, 15.0]);
    }
}
