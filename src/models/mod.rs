//! Spectrum model implementations.
//!
//! Leaves first:
//!
//! - `crosstalk`: cascade multiplicity table and per-order crosstalk weights
//! - `poisson`: photoelectron counting statistics
//! - `convolution`: Poisson ⊗ crosstalk peak amplitudes
//! - `langau`: Landau ⊗ Gaussian MIP peak
//! - `spectrum`: the full model, as evaluated by the fitter

pub mod convolution;
pub mod crosstalk;
pub mod langau;
pub mod poisson;
pub mod spectrum;

pub use convolution::*;
pub use crosstalk::*;
pub use langau::*;
pub use poisson::*;
pub use spectrum::*;
