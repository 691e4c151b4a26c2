/*!
# Bessel functions

Cylindrical `J_n(x)` and spherical `j_k(x)` Bessel functions of integer order evaluated with
Miller's downward recurrence, and their tables over the orders needed by the Vnm series.

The tables are evaluated in batches of orders: the two highest orders of a batch are evaluated
directly and the rest of the batch follows from the backward recurrences
```text
j_(k-1)(x) = (2k+1)/x·j_k(x) - j_(k+1)(x)
J_(n-1)(x) = 2n/x·J_n(x) - J_(n+1)(x)
```
*/

use std::f64::consts::TAU;

use num::complex::Complex64;

use crate::threading::{threaded_map, ThreadedExecuteParams};

const BIG: f64 = 1e200;
const TINY: f64 = 1e-12;

fn miller_start(order: usize, x: f64) -> usize {
    let mx = order.max(x.ceil() as usize);
    mx + 30 + ((60 * mx) as f64).sqrt() as usize
}

/// Cylindrical Bessel function of the first kind `J_n(x)`
pub fn cylindrical_bessel(n: usize, x: f64) -> f64 {
    if x < 0. {
        return if n % 2 == 0 { 1. } else { -1. } * cylindrical_bessel(n, -x);
    }
    if x < TINY {
        return match n {
            0 => 1.,
            1 => 0.5 * x,
            _ => 0.,
        };
    }
    let m = 2 * (miller_start(n, x) / 2);
    let tox = 2. / x;
    let (mut bjp, mut bj, mut sum, mut ans) = (0f64, 1f64, 0f64, 0f64);
    let mut jsum = false;
    for j in (1..=m).rev() {
        let bjm = j as f64 * tox * bj - bjp;
        bjp = bj;
        bj = bjm;
        if bj.abs() > BIG {
            bj /= BIG;
            bjp /= BIG;
            ans /= BIG;
            sum /= BIG;
        }
        if jsum {
            sum += bj;
        }
        jsum = !jsum;
        if j == n {
            ans = bjp;
        }
    }
    sum = 2. * sum - bj;
    if n == 0 {
        ans = bj;
    }
    ans / sum
}

/// Spherical Bessel function of the first kind `j_k(x)`
pub fn spherical_bessel(k: usize, x: f64) -> f64 {
    if x.abs() < TINY {
        return if k == 0 { 1. } else { 0. };
    }
    if x < 0. {
        return if k % 2 == 0 { 1. } else { -1. } * spherical_bessel(k, -x);
    }
    let j0 = x.sin() / x;
    if k == 0 {
        return j0;
    }
    let j1 = x.sin() / (x * x) - x.cos() / x;
    if k == 1 {
        return j1;
    }
    if (k as f64) < x {
        let (mut a, mut b) = (j0, j1);
        for i in 1..k {
            (a, b) = (b, (2 * i + 1) as f64 / x * b - a);
        }
        return b;
    }
    let m = miller_start(k, x);
    let (mut jp, mut j, mut ans) = (0f64, 1f64, 0f64);
    for i in (1..=m).rev() {
        let jm = (2 * i + 1) as f64 / x * j - jp;
        jp = j;
        j = jm;
        if j.abs() > BIG {
            j /= BIG;
            jp /= BIG;
            ans /= BIG;
        }
        if i == k {
            ans = jp;
        }
    }
    if j0.abs() >= j1.abs() {
        ans * j0 / j
    } else {
        ans * j1 / jp
    }
}

/// `f(k, x)` for `k = 0..num_orders` evaluated by batches of `batch_size` orders
///
/// `step(k, x, f_k, f_(k+1))` returns `f_(k-1)`.
/// A batch which seeds have both vanished is evaluated directly.
fn orders_by_batch<F, S>(num_orders: usize, x: f64, batch_size: usize, direct: F, step: S) -> Vec<f64>
where
    F: Fn(usize, f64) -> f64,
    S: Fn(usize, f64, f64, f64) -> f64,
{
    if batch_size <= 1 || x.abs() < TINY {
        return (0..num_orders).map(|k| direct(k, x)).collect();
    }
    let mut values = vec![0f64; num_orders];
    for lo in (0..num_orders).step_by(batch_size) {
        let hi = (lo + batch_size - 1).min(num_orders - 1);
        let (mut above, mut current) = (direct(hi + 1, x), direct(hi, x));
        if above == 0. && current == 0. {
            if direct(lo, x) != 0. {
                for k in lo..hi {
                    values[k] = direct(k, x);
                }
            }
            continue;
        }
        values[hi] = current;
        for k in (lo + 1..=hi).rev() {
            let below = step(k, x, current, above);
            values[k - 1] = below;
            above = current;
            current = below;
        }
    }
    if let Some(v0) = values.first_mut() {
        *v0 = direct(0, x);
    }
    values
}

/// `j_k(x)` for `k = 0..num_orders`
pub fn spherical_bessel_orders(num_orders: usize, x: f64, batch_size: usize) -> Vec<f64> {
    orders_by_batch(num_orders, x, batch_size, spherical_bessel, |k, x, jk, jk1| {
        (2 * k + 1) as f64 / x * jk - jk1
    })
}

/// `J_n(x)` for `n = 0..num_orders`
pub fn cylindrical_bessel_orders(num_orders: usize, x: f64, batch_size: usize) -> Vec<f64> {
    orders_by_batch(num_orders, x, batch_size, cylindrical_bessel, |n, x, jn, jn1| {
        (2 * n) as f64 / x * jn - jn1
    })
}

/// Spherical Bessel functions `j_k(f)` at the defocus parameter `f` of each PSF
///
/// The values are stored as `[k][psf]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SphericalBessel {
    num_orders: usize,
    defocus_params: Vec<f64>,
    values: Vec<f64>,
}
impl SphericalBessel {
    pub fn new(
        defocus_params: &[f64],
        num_orders: usize,
        batch_size: usize,
        params: &ThreadedExecuteParams,
    ) -> Self {
        let num_psfs = defocus_params.len();
        let columns: Vec<Vec<f64>> = threaded_map(params, [num_psfs], |[p]| {
            spherical_bessel_orders(num_orders, defocus_params[p], batch_size)
        });
        let mut values = vec![0f64; num_orders * num_psfs];
        for (p, column) in columns.into_iter().enumerate() {
            for (k, value) in column.into_iter().enumerate() {
                values[k * num_psfs + p] = value;
            }
        }
        Self {
            num_orders,
            defocus_params: defocus_params.to_vec(),
            values,
        }
    }
    pub fn num_orders(&self) -> usize {
        self.num_orders
    }
    pub fn num_psfs(&self) -> usize {
        self.defocus_params.len()
    }
    pub fn value(&self, k: usize, psf: usize) -> f64 {
        self.values[k * self.num_psfs() + psf]
    }
    /// `e^(if)·(2k+1)·i^k·j_k(f)`
    pub fn weight(&self, k: usize, psf: usize) -> Complex64 {
        let f = self.defocus_params[psf];
        let ik = match k % 4 {
            0 => Complex64::new(1., 0.),
            1 => Complex64::new(0., 1.),
            2 => Complex64::new(-1., 0.),
            _ => Complex64::new(0., -1.),
        };
        Complex64::from_polar(1., f) * ik * ((2 * k + 1) as f64 * self.value(k, psf))
    }
    /// The weights of every order and PSF, `[k][psf]`
    pub fn weights(&self) -> Vec<Complex64> {
        (0..self.num_orders)
            .flat_map(|k| (0..self.num_psfs()).map(move |p| self.weight(k, p)))
            .collect()
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

/// `J_n(2πr)/(2πr)` over a radius sampling
///
/// The values are stored as `[n][sample]`. At `r=0`, `J_0(x)/x` is replaced by 1,
/// `J_1(x)/x` by its limit `1/2` and the other orders by 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CylindricalBessel {
    num_orders: usize,
    num_samples: usize,
    values: Vec<f64>,
}
impl CylindricalBessel {
    pub fn new(
        radius: &[f64],
        num_orders: usize,
        batch_size: usize,
        params: &ThreadedExecuteParams,
    ) -> Self {
        let num_samples = radius.len();
        let columns: Vec<Vec<f64>> = threaded_map(params, [num_samples], |[s]| {
            let rp = TAU * radius[s];
            if rp.abs() < 1e-6 {
                (0..num_orders)
                    .map(|n| match n {
                        0 => 1.,
                        // J_1(x)/x -> 1/2
                        1 => 0.5,
                        _ => 0.,
                    })
                    .collect()
            } else {
                cylindrical_bessel_orders(num_orders, rp, batch_size)
                    .into_iter()
                    .map(|j| j / rp)
                    .collect()
            }
        });
        let mut values = vec![0f64; num_orders * num_samples];
        for (s, column) in columns.into_iter().enumerate() {
            for (n, value) in column.into_iter().enumerate() {
                values[n * num_samples + s] = value;
            }
        }
        Self {
            num_orders,
            num_samples,
            values,
        }
    }
    pub fn num_orders(&self) -> usize {
        self.num_orders
    }
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }
    /// `J_n(2πr)/(2πr)` at every radius sample
    pub fn row(&self, n: usize) -> &[f64] {
        &self.values[n * self.num_samples..(n + 1) * self.num_samples]
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}
