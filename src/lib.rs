/*!
# PSF stack

Point spread functions of a model eye computed with the Extended Nijboer-Zernike (ENZ) method.

The aberration of the eye, given as Zernike coefficients or a spectacle prescription, is turned by an
[eye model](eye) into the aberration coefficients of the eye at every field angle, wavelength, aperture
and focus distance of the [parameter grid](ranges).
The coefficients are [converted](coefficients::alpha_to_beta) into the complex Zernike basis of the ENZ
method and the PSFs are [synthesized](psf) from the [ENZ tables](enz) on the host or on a GPU
[backend].
[`PsfStack`](stack::PsfStack) sequences the computation and keeps the ENZ tables across computations.

```no_run
use psf_stack::{
    backend::ExecutionBackend,
    config::{AberrationParameters, PsfStackParameters},
    stack::{ComputationMask, PsfStack},
};

let settings = PsfStackParameters::default()
    .backend(ExecutionBackend::Cpu)
    .lambdas(vec![550.]);
let mut stack = PsfStack::new(settings);
stack.compute(&AberrationParameters::default(), ComputationMask::EVERYTHING)?;
println!("{} PSFs", stack.len());
# Ok::<(), psf_stack::Error>(())
```
*/

pub mod backend;
pub mod coefficients;
pub mod config;
pub mod defocus;
pub mod enz;
pub mod error;
pub mod eye;
pub mod preset;
pub mod psf;
pub mod ranges;
pub mod stack;
pub mod threading;
pub mod zernike;

pub use error::Error;
