/*!
# Extended Nijboer-Zernike engine

The tables shared by every PSF of a stack:
 - [`Wkl`]: the weights of the Bessel series of the Vnm functions,
 - [`CylindricalBessel`]: `J_n(2πr)/(2πr)` over a fixed radius sampling,
 - [`SphericalBessel`]: `j_k(f/2)` at the defocus parameter `f` of every PSF,
 - [`VnmInner`]: the `l` sums of the Vnm series, independent of the defocus.

[`EnzSampling`] sizes the tables from the parameters of the PSFs and each table is kept in a
[`Cache`] and only rebuilt when its [`CacheKey`] changes.
*/

use serde::{Deserialize, Serialize};

use crate::{
    backend::ExecutionBackend, config::PsfStackParameters, defocus::PsfEntryParams,
    zernike::num_positive_coefficients,
};

pub mod bessel;
pub mod vnm;
pub mod wkl;
pub use bessel::{CylindricalBessel, SphericalBessel};
pub use vnm::VnmInner;
pub use wkl::Wkl;

/// Minimum radial degree covered by the cylindrical Bessel table
///
/// Changing the beta degree below this value does not resize the table.
pub const CYLINDRICAL_DEGREE_CAPACITY: usize = 30;

/// Configuration a cache was built for
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheKey {
    pub max_degree: Option<usize>,
    pub max_order: usize,
    pub backend: Option<ExecutionBackend>,
    pub extent: Option<f64>,
}

/// Key of the spherical Bessel table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SphericalKey {
    pub key: CacheKey,
    /// Bessel function arguments, one per PSF
    pub defocus_params: Vec<f64>,
}

/// Key of the Vnm inner terms
///
/// The inner terms are summed from the Wkl and cylindrical Bessel tables, the build counters
/// of both tables tell which of their values were used.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VnmInnerKey {
    pub key: CacheKey,
    pub wkl_builds: usize,
    pub cylindrical_builds: usize,
}

/// A value together with the key it was built for
#[derive(Debug, Clone)]
pub struct Cache<K, T> {
    key: Option<K>,
    value: T,
    builds: usize,
}
impl<K, T: Default> Default for Cache<K, T> {
    fn default() -> Self {
        Self {
            key: None,
            value: T::default(),
            builds: 0,
        }
    }
}
impl<K: PartialEq, T: Default> Cache<K, T> {
    /// Checks if the cache was built for `key`
    pub fn is_current(&self, key: &K) -> bool {
        self.key.as_ref().is_some_and(|k| k == key)
    }
    /// Rebuilds the cache if `key` differs from the key of the cached value
    ///
    /// Returns `true` if the value has been rebuilt.
    pub fn update<E, F>(&mut self, key: K, build: F) -> Result<bool, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if self.is_current(&key) {
            return Ok(false);
        }
        self.value = build()?;
        self.key = Some(key);
        self.builds += 1;
        Ok(true)
    }
    pub fn value(&self) -> &T {
        &self.value
    }
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }
    /// Number of times the value has been built
    pub fn builds(&self) -> usize {
        self.builds
    }
    /// Drops the cached value, the next update rebuilds it
    pub fn invalidate(&mut self) {
        self.key = None;
        self.value = T::default();
    }
}

/// Global sampling of the ENZ tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnzSampling {
    pub max_samples: usize,
    /// Extent of the radius sampling in diffraction units
    pub max_extent: f64,
    /// Number of terms of the spherical Bessel series
    pub max_order: usize,
    pub max_degree: usize,
    pub max_coefficients: usize,
    /// Number of orders of the cylindrical Bessel table
    pub max_term_order: usize,
    pub max_terms_per_order: usize,
    /// Radius sampling in diffraction units
    pub radius: Vec<f64>,
    /// Spherical Bessel arguments, one per PSF in flat order
    pub defocus_params: Vec<f64>,
}
impl EnzSampling {
    pub fn new(settings: &PsfStackParameters, entries: &[PsfEntryParams]) -> Self {
        let max_samples = settings.max_approximation_samples.max(1);
        let max_extent = max_samples as f64 * settings.approximation_sample_size;
        let max_order = settings.approximation_terms_max.max(1);
        let max_degree = settings.beta_degrees;
        let cylindrical_degree = max_degree.max(CYLINDRICAL_DEGREE_CAPACITY);
        let radius = linspace(0., max_extent, max_samples);
        Self {
            max_samples,
            max_extent,
            max_order,
            max_degree,
            max_coefficients: num_positive_coefficients(max_degree),
            max_term_order: 2 * max_order + cylindrical_degree + 2,
            max_terms_per_order: max_degree + 3,
            radius,
            defocus_params: entries
                .iter()
                .map(|entry| 0.5 * entry.focus.defocus_param)
                .collect(),
        }
    }
    /// Radius step in diffraction units
    pub fn radius_step(&self) -> f64 {
        if self.max_samples > 1 {
            self.max_extent / (self.max_samples - 1) as f64
        } else {
            0.
        }
    }
    pub fn wkl_key(&self) -> CacheKey {
        CacheKey {
            max_degree: Some(self.max_degree),
            max_order: self.max_order,
            backend: None,
            extent: None,
        }
    }
    pub fn cylindrical_key(&self) -> CacheKey {
        CacheKey {
            max_degree: Some(self.max_degree.max(CYLINDRICAL_DEGREE_CAPACITY)),
            max_order: self.max_order,
            backend: None,
            extent: Some(self.max_extent),
        }
    }
    pub fn spherical_key(&self) -> SphericalKey {
        SphericalKey {
            key: CacheKey {
                max_degree: None,
                max_order: self.max_order,
                backend: None,
                extent: None,
            },
            defocus_params: self.defocus_params.clone(),
        }
    }
    pub fn vnm_inner_key(&self, backend: ExecutionBackend) -> CacheKey {
        CacheKey {
            max_degree: Some(self.max_degree),
            max_order: self.max_order,
            backend: Some(backend),
            extent: Some(self.max_extent),
        }
    }
}

/// `n` evenly spaced values from `start` to `end` included
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + i as f64 * step).collect()
        }
    }
}

/// The tables needed to evaluate the Vnm functions
#[derive(Debug, Clone, Copy)]
pub struct EnzTables<'a> {
    pub sampling: &'a EnzSampling,
    pub wkl: &'a Wkl,
    pub cylindrical: &'a CylindricalBessel,
    pub spherical: &'a SphericalBessel,
    /// `None` if the `l` sums are computed on the fly
    pub inner: Option<&'a VnmInner>,
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn cache_rebuilds_on_key_change() {
        let mut cache: Cache<CacheKey, Vec<f64>> = Cache::default();
        let key = CacheKey {
            max_degree: Some(4),
            max_order: 10,
            ..Default::default()
        };
        assert!(!cache.is_current(&key));
        let built = cache
            .update::<(), _>(key, || Ok(vec![1.]))
            .unwrap();
        assert!(built);
        let built = cache
            .update::<(), _>(key, || Ok(vec![2.]))
            .unwrap();
        assert!(!built);
        assert_eq!(cache.value(), &vec![1.]);
        let other = CacheKey {
            max_order: 11,
            ..key
        };
        assert!(cache.update::<(), _>(other, || Ok(vec![3.])).unwrap());
        assert_eq!(cache.builds(), 2);
        cache.invalidate();
        assert!(cache.key().is_none());
        assert!(cache.value().is_empty());
    }

    #[test]
    fn failed_build_keeps_cache() {
        let mut cache: Cache<CacheKey, Vec<f64>> = Cache::default();
        let key = CacheKey::default();
        assert!(cache.update(key, || Err("failed")).is_err());
        assert!(!cache.is_current(&key));
        assert_eq!(cache.builds(), 0);
    }

    #[test]
    fn sampling() {
        let settings = PsfStackParameters::default()
            .beta_degrees(8)
            .approximation_samples(0.2, 101)
            .approximation_terms(80., 10, 40);
        let enz = EnzSampling::new(&settings, &[PsfEntryParams::default()]);
        assert_eq!(enz.radius.len(), 101);
        assert!((enz.max_extent - 20.2).abs() < 1e-12);
        assert!((enz.radius[100] - enz.max_extent).abs() < 1e-12);
        assert_eq!(enz.max_term_order, 2 * 40 + 30 + 2);
        assert_eq!(enz.max_terms_per_order, 11);
        assert_eq!(enz.max_coefficients, 25);
        assert_eq!(enz.defocus_params, vec![0.]);
        // below the capacity the cylindrical key does not depend on the degree
        let enz_4 = EnzSampling::new(&settings.clone().beta_degrees(4), &[]);
        assert_eq!(enz.cylindrical_key(), enz_4.cylindrical_key());
        assert_ne!(enz.wkl_key(), enz_4.wkl_key());
    }

    #[test]
    fn linspaces() {
        assert!(linspace(0., 1., 0).is_empty());
        assert_eq!(linspace(2., 3., 1), vec![2.]);
        assert_eq!(linspace(0., 1., 5), vec![0., 0.25, 0.5, 0.75, 1.]);
    }
}
