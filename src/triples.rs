//! Beaver triple generation, run by P2. See spec §4.3 ("Triple generator").

use crate::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One party's share of a Beaver triple `(u_i, v_i, w_i)` such that
/// `u_0+u_1=U`, `v_0+v_1=V`, `w_0+w_1=f(U,V)` for the bilinear kernel `f`
/// the triple was generated for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triple<T: Tensor> {
    /// This party's share of `U`.
    pub u: T,
    /// This party's share of `V`.
    pub v: T,
    /// This party's share of `W = f(U, V)`.
    pub w: T,
}

/// Generate one Beaver triple, split into the two compute parties' shares.
///
/// `u_0, u_1 ~ N(0, sigma, shape_x)` and `v_0, v_1 ~ N(0, sigma, shape_y)` are
/// drawn from fresh generators; `W = f(u_0+u_1, v_0+v_1)`; `w_0 ~ N(0,
/// sigma^2, shape(W))`; `w_1 = W - w_0`. The elevated standard deviation for
/// `w` reflects that the product's variance is roughly `sigma^2 * sigma^2`.
pub fn generate_one<T, F>(
    shape_x: &[usize],
    shape_y: &[usize],
    f: F,
    share_std: f64,
    rng: &mut impl Rng,
) -> (Triple<T>, Triple<T>)
where
    T: Tensor,
    F: Fn(&T, &T) -> T,
{
    let u0 = T::normal(0.0, share_std, shape_x, rng);
    let u1 = T::normal(0.0, share_std, shape_x, rng);
    let v0 = T::normal(0.0, share_std, shape_y, rng);
    let v1 = T::normal(0.0, share_std, shape_y, rng);

    let u_sum = u0.clone() + u1.clone();
    let v_sum = v0.clone() + v1.clone();
    let w = f(&u_sum, &v_sum);

    let w_shape = w.shape();
    let w0 = T::normal(0.0, share_std * share_std, &w_shape, rng);
    let w1 = w - w0.clone();

    (Triple { u: u0, v: v0, w: w0 }, Triple { u: u1, v: v1, w: w1 })
}

/// Generate a batch of `count` triples, returning `(P0's triples, P1's
/// triples)` in matching order.
pub fn generate_batch<T, F>(
    shape_x: &[usize],
    shape_y: &[usize],
    f: F,
    share_std: f64,
    count: usize,
    rng: &mut impl Rng,
) -> (Vec<Triple<T>>, Vec<Triple<T>>)
where
    T: Tensor,
    F: Fn(&T, &T) -> T,
{
    let mut p0 = Vec::with_capacity(count);
    let mut p1 = Vec::with_capacity(count);
    for _ in 0..count {
        let (t0, t1) = generate_one(shape_x, shape_y, &f, share_std, rng);
        p0.push(t0);
        p1.push(t1);
    }
    (p0, p1)
}
