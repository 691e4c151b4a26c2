//! Parameter ranges and the 6-dimensional PSF grid

use serde::{Deserialize, Serialize};

/// A sampled `[min,max]` interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
    pub steps: usize,
}
impl ParameterRange {
    pub fn new(min: f64, max: f64, steps: usize) -> Self {
        Self { min, max, steps }
    }
    /// A range with a single sample
    pub fn constant(value: f64) -> Self {
        Self::new(value, value, 1)
    }
    /// Number of samples, at least 1
    pub fn num_steps(&self) -> usize {
        self.steps.max(1)
    }
    /// Distance between consecutive samples
    pub fn step(&self) -> f64 {
        (self.max - self.min) / (self.num_steps().saturating_sub(1).max(1)) as f64
    }
    /// Linearly spaced samples
    pub fn expand(&self) -> Vec<f64> {
        let step = self.step();
        (0..self.num_steps())
            .map(|i| self.min + i as f64 * step)
            .collect()
    }
    /// Reciprocal of the linearly spaced samples
    ///
    /// Used to turn dioptres into metres, a sample at 0 dioptre maps to `f64::INFINITY`.
    pub fn expand_dioptres(&self) -> Vec<f64> {
        self.expand().into_iter().map(|d| d.recip()).collect()
    }
}

/// Index of a PSF in the stack:
/// `[object distance, horizontal angle, vertical angle, wavelength, aperture, focus distance]`
pub type PsfIndex = [usize; 6];
/// Index of the aberration coefficients:
/// `[horizontal angle, vertical angle, wavelength, aperture, focus distance]`
pub type CoefficientIndex = [usize; 5];
/// Index of the focused eye parameters: `[aperture, focus distance]`
pub type FocusedIndex = [usize; 2];

/// Projection of a [`PsfIndex`] onto the aberration coefficient grid
pub fn coefficient_index(index: &PsfIndex) -> CoefficientIndex {
    [index[1], index[2], index[3], index[4], index[5]]
}
/// Projection of a [`PsfIndex`] onto the focused eye parameters grid
pub fn focused_index(index: &PsfIndex) -> FocusedIndex {
    [index[4], index[5]]
}

/// Row-major strides of an array of the given shape
pub fn strides<const N: usize>(shape: &[usize; N]) -> [usize; N] {
    let mut strides = [1usize; N];
    for i in (0..N.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
/// Total number of elements of an array of the given shape
pub fn num_elements<const N: usize>(shape: &[usize; N]) -> usize {
    shape.iter().product()
}
/// Linear index of a N-dimensional index
pub fn flat_index<const N: usize>(shape: &[usize; N], index: &[usize; N]) -> usize {
    strides(shape)
        .iter()
        .zip(index.iter())
        .map(|(s, i)| s * i)
        .sum()
}
/// N-dimensional index of a linear index
pub fn unflatten<const N: usize>(shape: &[usize; N], mut flat: usize) -> [usize; N] {
    let strides = strides(shape);
    let mut index = [0usize; N];
    for (i, s) in index.iter_mut().zip(strides.iter()) {
        *i = flat / s;
        flat %= s;
    }
    index
}

/// Iterator over all the indices of a N-dimensional array, in row-major order
pub struct IndexIterator<const N: usize> {
    shape: [usize; N],
    next: usize,
    len: usize,
}
impl<const N: usize> IndexIterator<N> {
    pub fn new(shape: [usize; N]) -> Self {
        Self {
            shape,
            next: 0,
            len: num_elements(&shape),
        }
    }
}
impl<const N: usize> Iterator for IndexIterator<N> {
    type Item = [usize; N];

    fn next(&mut self) -> Option<Self::Item> {
        if self.next < self.len {
            let index = unflatten(&self.shape, self.next);
            self.next += 1;
            Some(index)
        } else {
            None
        }
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len - self.next;
        (n, Some(n))
    }
}
impl<const N: usize> ExactSizeIterator for IndexIterator<N> {}

/// Dense row-major N-dimensional array
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray<T, const N: usize> {
    shape: [usize; N],
    data: Vec<T>,
}
impl<T, const N: usize> Default for NdArray<T, N> {
    fn default() -> Self {
        Self {
            shape: [0; N],
            data: Vec::new(),
        }
    }
}
impl<T: Clone + Default, const N: usize> NdArray<T, N> {
    pub fn new(shape: [usize; N]) -> Self {
        Self {
            shape,
            data: vec![T::default(); num_elements(&shape)],
        }
    }
    /// Clears the array and regrows it to `shape` with default values
    pub fn reset(&mut self, shape: [usize; N]) {
        self.data.clear();
        self.data.resize(num_elements(&shape), T::default());
        self.shape = shape;
    }
}
impl<T, const N: usize> NdArray<T, N> {
    pub fn from_vec(shape: [usize; N], data: Vec<T>) -> Option<Self> {
        (num_elements(&shape) == data.len()).then_some(Self { shape, data })
    }
    pub fn shape(&self) -> &[usize; N] {
        &self.shape
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn get(&self, index: &[usize; N]) -> Option<&T> {
        index
            .iter()
            .zip(self.shape.iter())
            .all(|(i, n)| i < n)
            .then(|| &self.data[flat_index(&self.shape, index)])
    }
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }
    pub fn indexed_iter(&self) -> impl Iterator<Item = ([usize; N], &T)> {
        IndexIterator::new(self.shape).zip(self.data.iter())
    }
}
impl<T, const N: usize> std::ops::Index<[usize; N]> for NdArray<T, N> {
    type Output = T;
    fn index(&self, index: [usize; N]) -> &Self::Output {
        &self.data[flat_index(&self.shape, &index)]
    }
}
impl<T, const N: usize> std::ops::IndexMut<[usize; N]> for NdArray<T, N> {
    fn index_mut(&mut self, index: [usize; N]) -> &mut Self::Output {
        let i = flat_index(&self.shape, &index);
        &mut self.data[i]
    }
}

/// The sampled values of every axis of the PSF grid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedParameters {
    /// Object distances `[m]`
    pub object_distances: Vec<f64>,
    /// Object distances `[D]`
    pub object_dioptres: Vec<f64>,
    /// Horizontal incidence angles `[deg]`
    pub angles_horizontal: Vec<f64>,
    /// Vertical incidence angles `[deg]`
    pub angles_vertical: Vec<f64>,
    /// Wavelengths `[nm]`
    pub lambdas: Vec<f64>,
    /// Aperture diameters `[mm]`
    pub aperture_diameters: Vec<f64>,
    /// Focus distances `[m]`
    pub focus_distances: Vec<f64>,
    /// Focus distances `[D]`
    pub focus_dioptres: Vec<f64>,
}
impl EvaluatedParameters {
    /// Shape of the PSF grid
    pub fn psf_shape(&self) -> PsfIndex {
        [
            self.object_distances.len(),
            self.angles_horizontal.len(),
            self.angles_vertical.len(),
            self.lambdas.len(),
            self.aperture_diameters.len(),
            self.focus_distances.len(),
        ]
    }
    /// Shape of the aberration coefficient grid
    pub fn coefficient_shape(&self) -> CoefficientIndex {
        let [_, h, v, l, a, f] = self.psf_shape();
        [h, v, l, a, f]
    }
    /// Shape of the focused eye parameters grid
    pub fn focused_shape(&self) -> FocusedIndex {
        [self.aperture_diameters.len(), self.focus_distances.len()]
    }
    /// Total number of PSFs
    pub fn num_psfs(&self) -> usize {
        num_elements(&self.psf_shape())
    }
    /// Iterator over all the PSF indices
    pub fn psf_indices(&self) -> IndexIterator<6> {
        IndexIterator::new(self.psf_shape())
    }
    /// Linear index of a PSF
    pub fn psf_id(&self, index: &PsfIndex) -> usize {
        flat_index(&self.psf_shape(), index)
    }
    /// The parameter values at a PSF index
    pub fn at(&self, index: &PsfIndex) -> PsfParameterValues {
        PsfParameterValues {
            object_distance: self.object_distances[index[0]],
            angle_horizontal: self.angles_horizontal[index[1]],
            angle_vertical: self.angles_vertical[index[2]],
            lambda: self.lambdas[index[3]],
            aperture_diameter: self.aperture_diameters[index[4]],
            focus_distance: self.focus_distances[index[5]],
            focus_dioptre: self.focus_dioptres[index[5]],
        }
    }
}
/// The parameter values of a single PSF
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsfParameterValues {
    pub object_distance: f64,
    pub angle_horizontal: f64,
    pub angle_vertical: f64,
    pub lambda: f64,
    pub aperture_diameter: f64,
    pub focus_distance: f64,
    pub focus_dioptre: f64,
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn expand_single() {
        assert_eq!(ParameterRange::new(1., 1., 1).expand(), vec![1.]);
        assert_eq!(ParameterRange::new(1., 5., 0).expand(), vec![1.]);
    }

    #[test]
    fn expand_linear() {
        let values = ParameterRange::new(0., 10., 11).expand();
        let expected: Vec<f64> = (0..=10).map(|x| x as f64).collect();
        assert_eq!(values.len(), expected.len());
        values
            .iter()
            .zip(expected.iter())
            .for_each(|(a, b)| assert!((a - b).abs() < 1e-12));
    }

    #[test]
    fn expand_dioptres() {
        let values = ParameterRange::new(0., 2., 3).expand_dioptres();
        assert!(values[0].is_infinite());
        assert_eq!(values[1], 1.);
        assert_eq!(values[2], 0.5);
    }

    #[test]
    fn index_round_trip() {
        let shape = [3, 1, 2, 3, 1, 4];
        let indices: Vec<_> = IndexIterator::new(shape).collect();
        assert_eq!(indices.len(), 72);
        for (k, index) in indices.iter().enumerate() {
            assert_eq!(flat_index(&shape, index), k);
        }
        assert_eq!(indices[1], [0, 0, 0, 0, 0, 1]);
        assert_eq!(indices[71], [2, 0, 1, 2, 0, 3]);
    }

    #[test]
    fn ndarray_reset() {
        let mut array = NdArray::<f64, 2>::new([2, 3]);
        array[[1, 2]] = 1.;
        assert_eq!(array.as_slice()[5], 1.);
        array.reset([1, 1]);
        assert_eq!(array.len(), 1);
        assert_eq!(array[[0, 0]], 0.);
        assert!(array.get(&[1, 0]).is_none());
    }
}
