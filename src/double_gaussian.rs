//! A circularly symmetric double-Gaussian PSF.

use crate::error::{MeasError, Result};
use crate::psf::Psf;

/// Sum of two concentric circular Gaussians: inner amplitude 1, outer
/// amplitude `b`, normalized to unit central value.
#[derive(Debug, Clone)]
pub struct DoubleGaussianPsf {
    width: usize,
    height: usize,
    sigma1: f64,
    sigma2: f64,
    b: f64,
}

impl DoubleGaussianPsf {
    /// `height == 0` means square realisations of side `width`.
    pub fn new(width: usize, height: usize, sigma1: f64, sigma2: f64, b: f64) -> Result<Self> {
        let mut sigma2 = sigma2;
        if b == 0.0 && sigma2 == 0.0 {
            sigma2 = 1.0; // avoid 0/0 at the centre
        }
        if sigma1 == 0.0 || sigma2 == 0.0 {
            return Err(MeasError::Domain(format!(
                "sigma may not be 0: {}, {}",
                sigma1, sigma2
            )));
        }
        Ok(DoubleGaussianPsf {
            width,
            height: if height == 0 { width } else { height },
            sigma1,
            sigma2,
            b,
        })
    }

    pub fn sigma1(&self) -> f64 {
        self.sigma1
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    pub fn b(&self) -> f64 {
        self.b
    }
}

impl Psf for DoubleGaussianPsf {
    fn value(&self, dx: f64, dy: f64) -> f64 {
        let r2 = dx * dx + dy * dy;
        let psf1 = (-r2 / (2.0 * self.sigma1 * self.sigma1)).exp();
        if self.b == 0.0 {
            return psf1;
        }
        let psf2 = (-r2 / (2.0 * self.sigma2 * self.sigma2)).exp();
        (psf1 + self.b * psf2) / (1.0 + self.b)
    }

    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_central_amplitude() {
        let psf = DoubleGaussianPsf::new(15, 15, 1.0, 3.0, 0.1).unwrap();
        assert!((psf.value(0.0, 0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_sigma_is_domain_error() {
        assert!(matches!(
            DoubleGaussianPsf::new(15, 15, 0.0, 1.0, 0.1),
            Err(MeasError::Domain(_))
        ));
    }

    #[test]
    fn test_zero_b_and_sigma2_fixup() {
        // A pure single Gaussian may be specified with b = sigma2 = 0.
        let psf = DoubleGaussianPsf::new(15, 15, 2.0, 0.0, 0.0).unwrap();
        assert!((psf.value(2.0, 0.0) - (-0.5f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_circular_symmetry() {
        let psf = DoubleGaussianPsf::new(15, 15, 1.5, 3.0, 0.2).unwrap();
        let a = psf.value(1.0, 2.0);
        let b = psf.value(2.0, 1.0);
        let c = psf.value(-1.0, -2.0);
        assert!((a - b).abs() < 1e-12);
        assert!((a - c).abs() < 1e-12);
    }

    #[test]
    fn test_outer_gaussian_broadens_wings() {
        let narrow = DoubleGaussianPsf::new(15, 15, 1.0, 0.0, 0.0).unwrap();
        let winged = DoubleGaussianPsf::new(15, 15, 1.0, 3.0, 0.1).unwrap();
        assert!(winged.value(4.0, 0.0) > narrow.value(4.0, 0.0));
    }
}
