/*!
# `w_kl` weights

Weights of the expansion of the Vnm functions into cylindrical Bessel functions:
```text
V_nm(r,f) = e^(if) Σ_k (2k+1)·i^k·j_k(f) Σ_l (-1)^l·w_kl·J_(m+2l+1)(2πr)/(2πr)
```
The weights are alternating sums of large combinatorial terms, they are computed with exact
rational arithmetic ([BigRational]) and only rounded to `f64` once summed.
For every `(n,m,k)`, `Σ_l w_kl = 1`.
*/

use num::{
    bigint::BigInt,
    integer::binomial,
    rational::BigRational,
    One, Signed, ToPrimitive, Zero,
};

use crate::{
    threading::{threaded_map, ThreadedExecuteParams},
    zernike::PositiveCoefficients,
};

fn choose(n: i64, k: i64) -> BigInt {
    if k < 0 || k > n {
        BigInt::zero()
    } else {
        binomial(BigInt::from(n), BigInt::from(k))
    }
}
fn ratio(numer: i64, denom: i64) -> BigRational {
    BigRational::new(BigInt::from(numer), BigInt::from(denom))
}
/// `A_k = C(2k,k)`
fn central(k: i64) -> BigInt {
    choose(2 * k, k)
}
/// `A_a / A_(a+d)`
fn central_ratio(a: i64, d: i64) -> BigRational {
    (a + 1..=a + d).fold(BigRational::one(), |r, i| r * ratio(i, 2 * (2 * i - 1)))
}

/// `b(s1,s2,t)` for `t = 0..=min(s1,s2)`
fn b(s1: i64, s2: i64, t: i64) -> BigRational {
    ratio(2 * s1 + 2 * s2 - 4 * t + 1, 2 * s1 + 2 * s2 - 2 * t + 1)
        * BigRational::from_integer(central(t) * central(s2 - t))
        * central_ratio(s1 - t, s2)
}
/// `f(p,s,m)` without its `(-1)^(p-s)` sign
fn f(p: i64, s: i64, m: i64) -> BigRational {
    ratio(2 * s + 1, p + s + 1)
        * BigRational::new(
            choose(m + p - s - 1, m - 1) * choose(m + p + s, s),
            choose(p + s, s),
        )
}
/// `g(u,l,m)` for `u = l..=l+m`
fn g(u: i64, l: i64, m: i64) -> BigRational {
    (1..=m).fold(
        ratio(m + 2 * l + 1, m + u + l + 1) * BigRational::from_integer(choose(m, u - l)),
        |r, i| r * ratio(l + i, u + l + i),
    )
}

/// Smallest `l` index of `w_kl`
pub fn l_min(n: i32, m: i32, k: usize) -> usize {
    let (p, q) = (((n - m) / 2) as i64, ((n + m) / 2) as i64);
    let k = k as i64;
    0.max(k - q).max(p - k) as usize
}
/// Largest `l` index of `w_kl`
pub fn l_max(n: i32, m: i32, k: usize) -> usize {
    k + ((n - m) / 2) as usize
}

/// Exact `w_kl` for `l = l_min..=l_max`, `m>=0`
pub fn wkl_row(n: i32, m: i32, k: usize) -> Vec<BigRational> {
    let (p, l_lo, l_hi) = (((n - m) / 2) as i64, l_min(n, m, k) as i64, l_max(n, m, k) as i64);
    let (k, m) = (k as i64, m as i64);
    if m == 0 {
        return (l_lo..=l_hi)
            .map(|l| {
                let j2 = k + p - l;
                if j2 % 2 == 0 && j2 / 2 <= k.min(p) {
                    b(k, p, j2 / 2)
                } else {
                    BigRational::zero()
                }
            })
            .collect();
    }
    // terms of the (s,t) double sum gathered by u = k+s-2t
    let mut c = vec![BigRational::zero(); (2 * p + 1) as usize];
    for s in 0..=p {
        let mut fs = f(p, s, m);
        if (p - s) % 2 == 1 {
            fs = -fs;
        }
        for t in 0..=k.min(s) {
            let u = k + s - 2 * t;
            c[(u - k + p) as usize] += &fs * b(k, s, t);
        }
    }
    (l_lo..=l_hi)
        .map(|l| {
            (l..=l + m)
                .filter(|u| (k - p..=k + p).contains(u))
                .map(|u| &c[(u - k + p) as usize] * g(u, l, m))
                .fold(BigRational::zero(), |w, t| w + t)
        })
        .collect()
}

/// Table of the signed weights `(-1)^l·w_kl`
///
/// The values are stored contiguously as `[n][m][k][l-l_min]` with
/// `n,m = 0..=max_degree`, `k = 0..max_order` and `max_degree+3` values per order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Wkl {
    max_degree: usize,
    max_order: usize,
    terms_per_order: usize,
    values: Vec<f64>,
}
impl Wkl {
    /// Computes the weights of every `(n,m>=0)` pair up to the radial degree `max_degree`
    /// and for the orders `k = 0..max_order`
    pub fn new(max_degree: usize, max_order: usize, params: &ThreadedExecuteParams) -> Self {
        let terms_per_order = max_degree + 3;
        let num_degrees = max_degree + 1;
        let mut values = vec![0f64; num_degrees * num_degrees * max_order * terms_per_order];

        let coefficients = PositiveCoefficients::new(max_degree);
        let rows: Vec<Vec<Vec<f64>>> =
            threaded_map(params, [coefficients.len()], |[c]| {
                let (n, m) = (coefficients[c].n(), coefficients[c].m());
                (0..max_order).map(|k| signed_row(n, m, k)).collect()
            });

        for (coefficient, rows) in coefficients.iter().zip(rows) {
            let (n, m) = (coefficient.n() as usize, coefficient.m() as usize);
            for (k, row) in rows.into_iter().enumerate() {
                let offset = ((n * num_degrees + m) * max_order + k) * terms_per_order;
                values[offset..offset + row.len()].copy_from_slice(&row);
            }
        }
        Self {
            max_degree,
            max_order,
            terms_per_order,
            values,
        }
    }
    pub fn max_degree(&self) -> usize {
        self.max_degree
    }
    pub fn max_order(&self) -> usize {
        self.max_order
    }
    pub fn terms_per_order(&self) -> usize {
        self.terms_per_order
    }
    /// Offset of the `(n,m)` block
    pub fn offset(&self, n: usize, m: usize) -> usize {
        (n * (self.max_degree + 1) + m) * self.max_order * self.terms_per_order
    }
    /// The signed weights of `(n,|m|,k)`, indexed by `l-l_min`
    pub fn row(&self, n: i32, m: i32, k: usize) -> &[f64] {
        let (n, m) = (n as usize, m.unsigned_abs() as usize);
        if n > self.max_degree || m > self.max_degree || k >= self.max_order {
            return &[];
        }
        let start = self.offset(n, m) + k * self.terms_per_order;
        &self.values[start..start + self.terms_per_order]
    }
    /// `Σ_l w_kl` of `(n,|m|,k)`
    pub fn sum(&self, n: i32, m: i32, k: usize) -> f64 {
        let l0 = l_min(n, m.abs(), k);
        self.row(n, m, k)
            .iter()
            .enumerate()
            .map(|(li, w)| if (l0 + li) % 2 == 0 { *w } else { -*w })
            .sum()
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
    /// Size in bytes
    pub fn size_of(&self) -> usize {
        self.values.len() * std::mem::size_of::<f64>()
    }
}

/// `(-1)^l·w_kl` rounded to `f64`, checking the sum of the weights
fn signed_row(n: i32, m: i32, k: usize) -> Vec<f64> {
    let l0 = l_min(n, m, k);
    let row = wkl_row(n, m, k);
    let sum = row
        .iter()
        .fold(BigRational::zero(), |s, w| s + w)
        .to_f64()
        .unwrap_or(f64::NAN);
    if (sum - 1.).abs() > 1e-3 {
        log::warn!("Sum of w[{n}, {m}, {k}] != 1 ({sum})");
    }
    row.iter()
        .enumerate()
        .map(|(li, w)| {
            let w_f64 = w.to_f64().unwrap_or(f64::NAN);
            if w.is_negative() && w_f64 < -1e-4 {
                log::warn!("w[{n}, {m}, {k}, {}] < 0 ({w_f64})", l0 + li);
            }
            if (l0 + li) % 2 == 0 {
                w_f64
            } else {
                -w_f64
            }
        })
        .collect()
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn exact_sums() {
        for n in 0..=10 {
            for m in (n % 2..=n).step_by(2) {
                for k in 0..25 {
                    let sum = wkl_row(n, m, k)
                        .iter()
                        .fold(BigRational::zero(), |s, w| s + w);
                    assert_eq!(sum, BigRational::one(), "(n,m,k)=({n},{m},{k})");
                }
            }
        }
    }

    #[test]
    fn non_negative() {
        for (n, m, k) in [(6, 2, 10), (8, 4, 3), (9, 1, 40), (12, 6, 200)] {
            assert!(wkl_row(n, m, k).iter().all(|w| !w.is_negative()));
        }
    }

    #[test]
    fn piston() {
        // V_00 only involves J_1: w_k0 = 1 for k = 0
        let row = wkl_row(0, 0, 0);
        assert_eq!(row, vec![BigRational::one()]);
        assert_eq!((l_min(0, 0, 3), l_max(0, 0, 3)), (3, 3));
    }

    #[test]
    fn table() {
        let params = ThreadedExecuteParams::new("wkl").num_threads(2);
        let wkl = Wkl::new(6, 12, &params);
        assert_eq!(wkl.terms_per_order(), 9);
        for n in 0..=6i32 {
            for m in (n % 2..=n).step_by(2) {
                for k in 0..12 {
                    assert!((wkl.sum(n, m, k) - 1.).abs() < 1e-3);
                    assert!((wkl.sum(n, -m, k) - 1.).abs() < 1e-3);
                }
            }
        }
        assert!(wkl.row(7, 1, 0).is_empty());
        assert!(wkl.row(2, 0, 12).is_empty());
    }

    #[test]
    fn high_order_sums() {
        for (n, m, k) in [(30, 2, 300), (30, 16, 1099), (29, 9, 700)] {
            let sum = wkl_row(n, m, k)
                .iter()
                .fold(BigRational::zero(), |s, w| s + w)
                .to_f64()
                .unwrap();
            assert!((sum - 1.).abs() < 1e-12);
        }
    }
}
