//! Spatial polynomials and linear-combination kernels.

use crate::error::{MeasError, Result};
use crate::image::Image;

/// A 2-D polynomial of a given order.
///
/// Terms are ordered by total degree, x-power descending within a degree:
/// f(x, y) = c0 + c1*x + c2*y + c3*x^2 + c4*x*y + c5*y^2 + ...
#[derive(Debug, Clone)]
pub struct PolynomialFunction2 {
    order: usize,
    coeffs: Vec<f64>,
}

impl PolynomialFunction2 {
    pub fn new(order: usize) -> Self {
        let n = (order + 1) * (order + 2) / 2;
        PolynomialFunction2 {
            order,
            coeffs: vec![0.0; n],
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn n_parameters(&self) -> usize {
        self.coeffs.len()
    }

    pub fn parameters(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn set_parameter(&mut self, index: usize, value: f64) {
        self.coeffs[index] = value;
    }

    pub fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.coeffs.len() {
            return Err(MeasError::InvalidArgument(format!(
                "expected {} polynomial coefficients, got {}",
                self.coeffs.len(),
                values.len()
            )));
        }
        self.coeffs.copy_from_slice(values);
        Ok(())
    }

    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        self.basis(x, y)
            .iter()
            .zip(&self.coeffs)
            .map(|(b, c)| b * c)
            .sum()
    }

    /// The derivative of the polynomial with respect to each coefficient,
    /// i.e. the monomial basis evaluated at (x, y).
    pub fn basis(&self, x: f64, y: f64) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.coeffs.len());
        for degree in 0..=self.order {
            for ypow in 0..=degree {
                let xpow = degree - ypow;
                out.push(x.powi(xpow as i32) * y.powi(ypow as i32));
            }
        }
        out
    }
}

/// A kernel expressible as sum_k f_k(x, y) * B_k: fixed basis images B_k
/// weighted by spatial polynomials f_k evaluated at the kernel's position.
///
/// A spatially constant ("fixed") kernel is represented with order-0
/// polynomials.
#[derive(Debug, Clone)]
pub struct LinearCombinationKernel {
    basis: Vec<Image<f64>>,
    spatial: Vec<PolynomialFunction2>,
    width: usize,
    height: usize,
}

impl LinearCombinationKernel {
    pub fn new(basis: Vec<Image<f64>>, spatial: Vec<PolynomialFunction2>) -> Result<Self> {
        if basis.is_empty() {
            return Err(MeasError::InvalidArgument(
                "kernel must have at least one basis component".to_string(),
            ));
        }
        if basis.len() != spatial.len() {
            return Err(MeasError::InvalidArgument(format!(
                "{} basis images but {} spatial functions",
                basis.len(),
                spatial.len()
            )));
        }
        let width = basis[0].width();
        let height = basis[0].height();
        if basis.iter().any(|b| b.width() != width || b.height() != height) {
            return Err(MeasError::InvalidArgument(
                "basis images must share dimensions".to_string(),
            ));
        }
        Ok(LinearCombinationKernel {
            basis,
            spatial,
            width,
            height,
        })
    }

    /// Build a spatially constant kernel from basis images and one weight
    /// per basis.
    pub fn new_fixed(basis: Vec<Image<f64>>, weights: &[f64]) -> Result<Self> {
        if basis.len() != weights.len() {
            return Err(MeasError::InvalidArgument(format!(
                "{} basis images but {} weights",
                basis.len(),
                weights.len()
            )));
        }
        let spatial = weights
            .iter()
            .map(|&w| {
                let mut f = PolynomialFunction2::new(0);
                f.set_parameter(0, w);
                f
            })
            .collect();
        LinearCombinationKernel::new(basis, spatial)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Index of the kernel's centre pixel.
    pub fn ctr(&self) -> (i32, i32) {
        (self.width as i32 / 2, self.height as i32 / 2)
    }

    pub fn n_basis(&self) -> usize {
        self.basis.len()
    }

    pub fn basis_images(&self) -> &[Image<f64>] {
        &self.basis
    }

    pub fn spatial_functions(&self) -> &[PolynomialFunction2] {
        &self.spatial
    }

    /// Number of coefficients of each spatial polynomial.
    pub fn n_spatial_parameters(&self) -> usize {
        self.spatial[0].n_parameters()
    }

    /// The per-basis spatial coefficients, one row per basis component.
    pub fn spatial_parameters(&self) -> Vec<Vec<f64>> {
        self.spatial.iter().map(|f| f.parameters().to_vec()).collect()
    }

    /// Set all spatial coefficients from a flat slice laid out component
    /// by component.
    pub fn set_spatial_parameters(&mut self, coeffs: &[f64]) -> Result<()> {
        let ns = self.n_spatial_parameters();
        if coeffs.len() != self.basis.len() * ns {
            return Err(MeasError::InvalidArgument(format!(
                "expected {} spatial coefficients, got {}",
                self.basis.len() * ns,
                coeffs.len()
            )));
        }
        for (i, f) in self.spatial.iter_mut().enumerate() {
            f.set_parameters(&coeffs[i * ns..(i + 1) * ns])?;
        }
        Ok(())
    }

    /// Realise the kernel at position (x, y): sum_k f_k(x, y) * B_k.
    pub fn compute_image(&self, x: f64, y: f64) -> Image<f64> {
        let mut out = Image::new(self.width, self.height);
        for (basis, f) in self.basis.iter().zip(&self.spatial) {
            let w = f.evaluate(x, y);
            for (o, b) in out.pixels_mut().iter_mut().zip(basis.pixels()) {
                *o += w * b;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polynomial_term_count() {
        assert_eq!(PolynomialFunction2::new(0).n_parameters(), 1);
        assert_eq!(PolynomialFunction2::new(1).n_parameters(), 3);
        assert_eq!(PolynomialFunction2::new(2).n_parameters(), 6);
        assert_eq!(PolynomialFunction2::new(3).n_parameters(), 10);
    }

    #[test]
    fn test_polynomial_evaluation() {
        let mut f = PolynomialFunction2::new(2);
        // 1 + 2x + 3y + 4x^2 + 5xy + 6y^2
        f.set_parameters(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let v = f.evaluate(2.0, 3.0);
        assert_eq!(v, 1.0 + 4.0 + 9.0 + 16.0 + 30.0 + 54.0);
    }

    #[test]
    fn test_polynomial_basis_is_gradient() {
        let f = PolynomialFunction2::new(2);
        let b = f.basis(2.0, 3.0);
        assert_eq!(b, vec![1.0, 2.0, 3.0, 4.0, 6.0, 9.0]);
    }

    #[test]
    fn test_empty_kernel_is_invalid() {
        assert!(matches!(
            LinearCombinationKernel::new(vec![], vec![]),
            Err(MeasError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_compute_image_combines_basis() {
        let mut b0 = Image::<f64>::new(3, 3);
        b0.fill(1.0);
        let mut b1 = Image::<f64>::new(3, 3);
        b1.fill(10.0);
        let mut f0 = PolynomialFunction2::new(1);
        f0.set_parameters(&[1.0, 0.0, 0.0]).unwrap();
        let mut f1 = PolynomialFunction2::new(1);
        f1.set_parameters(&[0.0, 1.0, 0.0]).unwrap(); // f1 = x
        let kernel = LinearCombinationKernel::new(vec![b0, b1], vec![f0, f1]).unwrap();
        let im = kernel.compute_image(2.0, 0.0);
        // 1*1 + 2*10 everywhere
        assert_eq!(im.get(1, 1), 21.0);
    }

    #[test]
    fn test_fixed_kernel_weights() {
        let mut b0 = Image::<f64>::new(3, 3);
        b0.fill(1.0);
        let kernel = LinearCombinationKernel::new_fixed(vec![b0], &[2.5]).unwrap();
        let im = kernel.compute_image(100.0, 100.0);
        assert_eq!(im.get(0, 0), 2.5);
    }
}
