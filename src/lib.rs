//! Measurement algorithms for a wide-field astronomical imaging pipeline.
//!
//! Two cooperating subsystems over a shared masked-image substrate:
//!
//! * **Cosmic-ray detection and repair** ([`find_cosmic_rays`]): a
//!   multi-pass pixel classifier with connected-component labeling,
//!   iterative growth under mask constraints, and bias-corrected local
//!   interpolation over the contaminated pixels.
//! * **Spatial PSF modeling** ([`create_kernel_from_psf_candidates`],
//!   [`fit_spatial_kernel`]): weighted PCA over star postage-stamps
//!   arranged in spatial cells, producing a linear-combination kernel
//!   whose per-basis weights vary as 2-D polynomials in position, fit
//!   either by a direct normal-equations solve or a nonlinear minimizer.
//!
//! The substrate is [`MaskedImage`]: per-pixel image value, variance
//! (zero meaning infinite), and a named-plane bitmask. `f32` and `f64`
//! image types are both supported.

pub mod cosmic_ray;
pub mod double_gaussian;
pub mod error;
pub mod footprint;
pub mod image;
pub mod interp;
pub mod kernel;
pub mod masked_image;
pub mod pca;
pub mod psf;
pub mod spatial_cell;
pub mod spatial_model;

// Re-export commonly used items
pub use cosmic_ray::{find_cosmic_rays, CrPolicy};
pub use double_gaussian::DoubleGaussianPsf;
pub use error::{MeasError, Result};
pub use footprint::{Footprint, Span};
pub use image::{Image, Pixel};
pub use kernel::{LinearCombinationKernel, PolynomialFunction2};
pub use masked_image::{MaskPixel, MaskPlanes, MaskedImage};
pub use psf::{KernelPsf, Psf, PsfAttributes, PsfRegistry};
pub use spatial_cell::{PsfCandidate, SpatialCellSet};
pub use spatial_model::{
    count_psf_candidates, create_kernel_from_psf_candidates, fit_kernel_to_image,
    fit_spatial_kernel, fit_spatial_kernel_from_psf_candidates, subtract_psf,
};
