/*!
# Zernike polynomial indexing

Conversions between the single index conventions (Noll and ANSI) and the double index `(n,m)`
of Zernike polynomials, together with the coefficient containers used throughout the crate:
 - [`ZernikeCoefficients`]: real ("alpha") coefficients,
 - [`ComplexZernikeCoefficients`]: complex ("beta") coefficients.

Both containers are indexed by the Noll index, starting at 1, the 0th entry is never used.
*/

use std::ops::{Deref, DerefMut};

use num::complex::Complex64;
use serde::{Deserialize, Serialize};

/// Highest radial degree of the alpha coefficients
pub const MAX_DEGREES: usize = 6;

/// Number of Zernike polynomials up to and including the radial degree `max_degree`
pub fn num_coefficients(max_degree: usize) -> usize {
    (max_degree + 1) * (max_degree + 2) / 2
}

/// Number of Zernike polynomials with `m>=0` up to and including the radial degree `max_degree`
pub fn num_positive_coefficients(max_degree: usize) -> usize {
    (0..=max_degree).map(|n| n / 2 + 1).sum()
}

/// ANSI single index to `(n,m)`
pub fn single2double_ansi(j: usize) -> (i32, i32) {
    let n = ((2. * j as f64 + 1.).sqrt() + 0.5).floor() as i32 - 1;
    let m = 2 * j as i32 - n * (n + 2);
    (n, m)
}

/// `(n,m)` to ANSI single index
pub fn double2single_ansi(n: i32, m: i32) -> usize {
    ((n * n + 2 * n + m) / 2) as usize
}

/// Noll single index to `(n,m)`
pub fn single2double_noll(j: usize) -> (i32, i32) {
    let mut n = 0i32;
    let mut j1 = j as i32 - 1;
    while j1 > n {
        n += 1;
        j1 -= n;
    }
    let sign = if j % 2 == 0 { 1 } else { -1 };
    let m = sign * ((n % 2) + 2 * ((j1 + (n + 1) % 2) / 2));
    (n, m)
}

/// `(n,m)` to Noll single index
///
/// All the polynomials of radial degree `n` occupy the Noll indices
/// `n(n+1)/2+1 ..= (n+1)(n+2)/2`, so the search is limited to that row.
/// Returns `None` if `(n,m)` is not a valid pair.
pub fn double2single_noll(n: i32, m: i32) -> Option<usize> {
    if n < 0 || m.abs() > n || (n - m.abs()) % 2 != 0 {
        return None;
    }
    let n_u = n as usize;
    let first = n_u * (n_u + 1) / 2 + 1;
    let last = num_coefficients(n_u);
    (first..=last).find(|&j| single2double_noll(j) == (n, m))
}

/// Noll index to ANSI index
pub fn noll2ansi(j: usize) -> usize {
    let (n, m) = single2double_noll(j);
    double2single_ansi(n, m)
}

/// ANSI index to Noll index
pub fn ansi2noll(j: usize) -> Option<usize> {
    let (n, m) = single2double_ansi(j);
    double2single_noll(n, m)
}

/// Common name of a Zernike polynomial
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZernikeName {
    pub noll: usize,
    pub ansi: usize,
    pub degree: (i32, i32),
    pub name: &'static str,
    pub description: &'static str,
}
macro_rules! zname {
    ($noll:expr, $ansi:expr, $n:expr, $m:expr, $name:expr, $desc:expr) => {
        ZernikeName {
            noll: $noll,
            ansi: $ansi,
            degree: ($n, $m),
            name: $name,
            description: $desc,
        }
    };
}
/// Names of the first 45 Zernike polynomials, in Noll order
pub const ZERNIKE_NAMES: [ZernikeName; 45] = [
    zname!(1, 0, 0, 0, "Z1", "Piston"),
    zname!(2, 2, 1, 1, "Z3", "x Tilt"),
    zname!(3, 1, 1, -1, "Z2", "y Tilt"),
    zname!(4, 4, 2, 0, "Z5", "Defocus"),
    zname!(5, 3, 2, -2, "Z4", "Primary Oblique Astigmatism"),
    zname!(6, 5, 2, 2, "Z6", "Primary Vertical Astigmatism"),
    zname!(7, 7, 3, -1, "Z8", "y Coma"),
    zname!(8, 8, 3, 1, "Z9", "x Coma"),
    zname!(9, 6, 3, -3, "Z7", "y Trefoil"),
    zname!(10, 9, 3, 3, "Z10", "x Trefoil"),
    zname!(11, 12, 4, 0, "Z13", "Primary Spherical"),
    zname!(12, 13, 4, 2, "Z14", "Secondary Vertical Astigmatism"),
    zname!(13, 11, 4, -2, "Z12", "Secondary Oblique Astigmatism"),
    zname!(14, 14, 4, 4, "Z15", "x Quadrafoil"),
    zname!(15, 10, 4, -4, "Z11", "y Quadrafoil"),
    zname!(16, 18, 5, 1, "Z19", "Secondary x Coma"),
    zname!(17, 17, 5, -1, "Z18", "Secondary y Coma"),
    zname!(18, 19, 5, 3, "Z20", "Secondary x Trefoil"),
    zname!(19, 16, 5, -3, "Z17", "Secondary y Trefoil"),
    zname!(20, 20, 5, 5, "Z21", "Pentafoil x"),
    zname!(21, 15, 5, -5, "Z16", "Pentafoil y"),
    zname!(22, 24, 6, 0, "Z25", "Secondary Spherical"),
    zname!(23, 23, 6, -2, "Z24", "Tertiary Oblique Astigmatism"),
    zname!(24, 25, 6, 2, "Z26", "Tertiary Vertical Astigmatism"),
    zname!(25, 22, 6, -4, "Z23", "Secondary y Quadrafoil"),
    zname!(26, 26, 6, 4, "Z27", "Secondary x Quadrafoil"),
    zname!(27, 21, 6, -6, "Z22", "y Hexafoil"),
    zname!(28, 27, 6, 6, "Z28", "x Hexafoil"),
    zname!(29, 31, 7, -1, "Z32", "Tertiary y Coma"),
    zname!(30, 32, 7, 1, "Z33", "Tertiary x Coma"),
    zname!(31, 30, 7, -3, "Z31", "Tertiary y Trefoil"),
    zname!(32, 33, 7, 3, "Z34", "Tertiary x Trefoil"),
    zname!(33, 29, 7, -5, "Z30", "Secondary y Pentafoil"),
    zname!(34, 34, 7, 5, "Z35", "Secondary x Pentafoil"),
    zname!(35, 28, 7, -7, "Z29", "y Heptafoil"),
    zname!(36, 35, 7, 7, "Z36", "x Heptafoil"),
    zname!(37, 40, 8, 0, "Z41", "Quadrary Spherical"),
    zname!(38, 41, 8, 2, "Z42", "Quadrary Vertical Astigmatism"),
    zname!(39, 39, 8, -2, "Z40", "Quadrary Oblique Astigmatism"),
    zname!(40, 42, 8, 4, "Z43", "Tertiary Quadrafoil x"),
    zname!(41, 38, 8, -4, "Z39", "Tertiary Quadrafoil y"),
    zname!(42, 43, 8, 6, "Z44", "Secondary Hexafoil x"),
    zname!(43, 37, 8, -6, "Z38", "Secondary Hexafoil y"),
    zname!(44, 44, 8, 8, "Z45", "Octafoil x"),
    zname!(45, 36, 8, -8, "Z37", "Octafoil y"),
];
/// Name table entry of the Noll index `j`, if any
pub fn zernike_name(j: usize) -> Option<&'static ZernikeName> {
    j.checked_sub(1).and_then(|i| ZERNIKE_NAMES.get(i))
}
/// Short name (`Z{ansi+1}`) of the Noll index `j`
pub fn short_name(j: usize) -> String {
    format!("Z{}", noll2ansi(j) + 1)
}

/// A Zernike pair `(n,m)`, `(n,-m)` with `m>=0`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositiveCoefficient {
    pub degrees: [(i32, i32); 2],
    pub ansi: [usize; 2],
    pub noll: [usize; 2],
}
impl PositiveCoefficient {
    pub fn new(n: i32, m: i32) -> Self {
        let degrees = [(n, m), (n, -m)];
        Self {
            degrees,
            ansi: [double2single_ansi(n, m), double2single_ansi(n, -m)],
            noll: [
                double2single_noll(n, m).unwrap_or_default(),
                double2single_noll(n, -m).unwrap_or_default(),
            ],
        }
    }
    pub fn n(&self) -> i32 {
        self.degrees[0].0
    }
    pub fn m(&self) -> i32 {
        self.degrees[0].1
    }
}
/// All the [`PositiveCoefficient`]s up to a given radial degree, ordered by `n` then `m`
#[derive(Debug, Clone)]
pub struct PositiveCoefficients(Vec<PositiveCoefficient>);
impl Deref for PositiveCoefficients {
    type Target = Vec<PositiveCoefficient>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl PositiveCoefficients {
    pub fn new(max_degree: usize) -> Self {
        let max_degree = max_degree as i32;
        Self(
            (0..=max_degree)
                .flat_map(|n| {
                    (n % 2..=n)
                        .step_by(2)
                        .map(move |m| PositiveCoefficient::new(n, m))
                })
                .collect(),
        )
    }
}

/// Real Zernike coefficients indexed by Noll index (`[0]` is unused)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZernikeCoefficients(Vec<f64>);
impl Deref for ZernikeCoefficients {
    type Target = Vec<f64>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for ZernikeCoefficients {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
impl Default for ZernikeCoefficients {
    fn default() -> Self {
        Self::with_degree(MAX_DEGREES)
    }
}
impl From<Vec<f64>> for ZernikeCoefficients {
    fn from(value: Vec<f64>) -> Self {
        Self(value)
    }
}
impl ZernikeCoefficients {
    /// Zero coefficients up to the radial degree `max_degree`
    pub fn with_degree(max_degree: usize) -> Self {
        Self(vec![0f64; num_coefficients(max_degree) + 1])
    }
    /// Number of usable coefficients
    pub fn num_coefficients(&self) -> usize {
        self.0.len().saturating_sub(1)
    }
    /// Sets the coefficient of `(n,m)`, ignored if out of range
    pub fn set_coefficient(&mut self, n: i32, m: i32, value: f64) -> bool {
        match double2single_noll(n, m) {
            Some(j) if j < self.0.len() => {
                self.0[j] = value;
                true
            }
            _ => false,
        }
    }
    /// Coefficient of `(n,m)`, zero if out of range
    pub fn coefficient(&self, n: i32, m: i32) -> f64 {
        double2single_noll(n, m)
            .and_then(|j| self.0.get(j).copied())
            .unwrap_or_default()
    }
    /// Iterator over the `(noll index, value)` pairs
    pub fn indexed(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.0.iter().copied().enumerate().skip(1)
    }
}

/// Complex Zernike coefficients indexed by Noll index (`[0]` is unused)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComplexZernikeCoefficients(Vec<Complex64>);
impl Deref for ComplexZernikeCoefficients {
    type Target = Vec<Complex64>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for ComplexZernikeCoefficients {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
impl From<Vec<Complex64>> for ComplexZernikeCoefficients {
    fn from(value: Vec<Complex64>) -> Self {
        Self(value)
    }
}
impl ComplexZernikeCoefficients {
    pub fn with_degree(max_degree: usize) -> Self {
        Self(vec![Complex64::default(); num_coefficients(max_degree) + 1])
    }
    /// Coefficient of the Noll index `j`, zero if out of range
    pub fn at(&self, j: usize) -> Complex64 {
        self.0.get(j).copied().unwrap_or_default()
    }
}
