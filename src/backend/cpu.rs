//! Host PSF computation

use crate::{
    config::PsfStackParameters,
    defocus::PsfEntryParams,
    enz::{vnm::vnm, EnzTables},
    psf::{self, PsfEntry, PsfError},
    threading::{threaded_map, ThreadedExecuteParams},
};

type Result<T> = std::result::Result<T, PsfError>;

/// Computes the PSF of the entry `psf_id`
pub fn compute_psf(
    settings: &PsfStackParameters,
    entry: &PsfEntryParams,
    psf_id: usize,
    tables: &EnzTables,
) -> Result<PsfEntry> {
    let terms = entry.enz_sampling.terms;
    let samples = entry.enz_samples(tables.sampling.max_samples);
    psf::synthesize(settings, entry, tables.sampling.radius_step(), |coefficient| {
        vnm(tables, psf_id, coefficient.n(), coefficient.m(), terms, samples)
    })
}

/// Computes the PSFs of all the entries, in parallel
pub fn compute_psfs(
    settings: &PsfStackParameters,
    entries: &[PsfEntryParams],
    tables: &EnzTables,
    params: &ThreadedExecuteParams,
) -> Result<Vec<PsfEntry>> {
    let psfs: Vec<Result<PsfEntry>> = threaded_map(params, [entries.len()], |[p]| {
        let psf = compute_psf(settings, &entries[p], p, tables);
        if settings.log_debug {
            if let Ok(psf) = &psf {
                log::debug!("PSF #{p}: {}x{}", psf.kernel_size, psf.kernel_size);
            }
        }
        psf
    });
    psfs.into_iter().collect()
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::backend::tests::Fixture;

    #[test]
    fn unaberrated_psf() {
        let fixture = Fixture::new();
        let psf = compute_psf(&fixture.settings, &fixture.entries[0], 0, &fixture.tables()).unwrap();
        assert_eq!(psf.kernel_size, 21);
        assert!((psf.kernel.iter().sum::<f64>() - 1.).abs() < 1e-6);
        let max = psf.kernel.iter().copied().fold(0f64, f64::max);
        assert_eq!(psf.at(10, 10), max);
        // circular symmetry
        for (i, j) in [(10, 3), (4, 10), (7, 13)] {
            assert!((psf.at(i, j) - psf.at(j, i)).abs() < 1e-9);
            assert!((psf.at(i, j) - psf.at(20 - i, 20 - j)).abs() < 1e-9);
        }
    }

    #[test]
    fn cached_inner_sums() {
        let fixture = Fixture::new();
        let params = ThreadedExecuteParams::new("cpu").num_threads(2);
        let direct =
            compute_psfs(&fixture.settings, &fixture.entries, &fixture.tables(), &params).unwrap();
        let inner = fixture.inner();
        let tables = EnzTables {
            inner: Some(&inner),
            ..fixture.tables()
        };
        let cached = compute_psfs(&fixture.settings, &fixture.entries, &tables, &params).unwrap();
        assert_eq!(direct.len(), 2);
        for (d, c) in direct.iter().zip(&cached) {
            assert_eq!(d.kernel_size % 2, 1);
            d.kernel
                .iter()
                .zip(&c.kernel)
                .for_each(|(d, c)| assert!((d - c).abs() < 1e-12));
        }
        // coma along x
        let comatic = &direct[1];
        assert!((comatic.at(10, 4) - comatic.at(10, 16)).abs() > 1e-9);
        assert!((comatic.at(4, 10) - comatic.at(16, 10)).abs() < 1e-9);
    }

    #[test]
    fn omitted_psf() {
        let fixture = Fixture::new();
        let mut settings = fixture.settings.clone();
        settings.omit_psf_calculation = true;
        let psf = compute_psf(&settings, &fixture.entries[1], 1, &fixture.tables()).unwrap();
        assert!(psf.kernel.iter().all(|v| *v == 0.));
    }
}
