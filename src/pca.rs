//! Weighted principal component analysis over a set of equally sized
//! images, by the snapshot method: eigendecompose the weighted Gram matrix
//! of the input images and back-project the eigenvectors.

use log::debug;
use nalgebra::{DMatrix, SymmetricEigen};

use crate::error::{MeasError, Result};
use crate::image::{inner_product, Image};

/// Accumulates images (with optional per-image weights) and produces
/// eigen-images and eigenvalues in descending eigenvalue order.
#[derive(Debug, Default)]
pub struct ImagePca {
    constant_weight: bool,
    images: Vec<Image<f64>>,
    weights: Vec<f64>,
    eigen_images: Vec<Image<f64>>,
    eigen_values: Vec<f64>,
}

impl ImagePca {
    /// With `constant_weight` every image enters the decomposition with
    /// unit weight regardless of the weight passed to `add_image`.
    pub fn new(constant_weight: bool) -> Self {
        ImagePca {
            constant_weight,
            ..ImagePca::default()
        }
    }

    pub fn n_images(&self) -> usize {
        self.images.len()
    }

    pub fn add_image(&mut self, image: Image<f64>, weight: f64) -> Result<()> {
        if let Some(first) = self.images.first() {
            if image.width() != first.width() || image.height() != first.height() {
                return Err(MeasError::InvalidArgument(format!(
                    "image {}x{} does not match set dimensions {}x{}",
                    image.width(),
                    image.height(),
                    first.width(),
                    first.height()
                )));
            }
        }
        let weight = if self.constant_weight { 1.0 } else { weight };
        if !(weight.is_finite() && weight > 0.0) {
            return Err(MeasError::InvalidArgument(format!(
                "image weight must be positive and finite, got {}",
                weight
            )));
        }
        self.images.push(image);
        self.weights.push(weight);
        Ok(())
    }

    /// Decompose the accumulated set.
    pub fn analyze(&mut self) -> Result<()> {
        let n = self.images.len();
        if n == 0 {
            return Err(MeasError::InvalidArgument(
                "no images to analyze".to_string(),
            ));
        }

        let mut gram = DMatrix::<f64>::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                let dot = inner_product(&self.images[i], &self.images[j], 0)?
                    * self.weights[i]
                    * self.weights[j];
                gram[(i, j)] = dot;
                gram[(j, i)] = dot;
            }
        }

        let eig = SymmetricEigen::new(gram);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            eig.eigenvalues[b]
                .partial_cmp(&eig.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let width = self.images[0].width();
        let height = self.images[0].height();
        self.eigen_images.clear();
        self.eigen_values.clear();
        for &k in &order {
            let mut component = Image::<f64>::new(width, height);
            for (i, image) in self.images.iter().enumerate() {
                let u = eig.eigenvectors[(i, k)] * self.weights[i];
                for (c, p) in component.pixels_mut().iter_mut().zip(image.pixels()) {
                    *c += u * p;
                }
            }
            let norm = component.pixels().iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                component.scale_values(1.0 / norm);
            }
            self.eigen_images.push(component);
            self.eigen_values.push(eig.eigenvalues[k].max(0.0));
        }
        debug!(
            "PCA over {} images: leading eigenvalue {:.4e}",
            n, self.eigen_values[0]
        );
        Ok(())
    }

    pub fn eigen_images(&self) -> &[Image<f64>] {
        &self.eigen_images
    }

    pub fn eigen_values(&self) -> &[f64] {
        &self.eigen_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_image(size: usize, sigma: f64, amplitude: f64) -> Image<f64> {
        let mut im = Image::new(size, size);
        let c = (size / 2) as f64;
        for y in 0..size as i32 {
            for x in 0..size as i32 {
                let r2 = (x as f64 - c).powi(2) + (y as f64 - c).powi(2);
                im.set(x, y, amplitude * (-r2 / (2.0 * sigma * sigma)).exp());
            }
        }
        im
    }

    #[test]
    fn test_identical_images_have_one_component() {
        let mut pca = ImagePca::new(false);
        for _ in 0..5 {
            pca.add_image(gaussian_image(15, 2.0, 100.0), 100.0).unwrap();
        }
        pca.analyze().unwrap();
        let values = pca.eigen_values();
        assert!(values[0] > 0.0);
        // All the variance lives in the first component.
        for &v in &values[1..] {
            assert!(v / values[0] < 1e-9, "unexpected secondary eigenvalue {}", v);
        }
        // The leading eigen-image is the common shape, up to sign and scale.
        let eigen = &pca.eigen_images()[0];
        let reference = gaussian_image(15, 2.0, 100.0);
        let dot = inner_product(eigen, &reference, 0).unwrap();
        let ref_norm = inner_product(&reference, &reference, 0).unwrap().sqrt();
        assert!((dot.abs() / ref_norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_eigenvalues_are_descending() {
        let mut pca = ImagePca::new(true);
        pca.add_image(gaussian_image(11, 1.5, 1.0), 1.0).unwrap();
        pca.add_image(gaussian_image(11, 2.5, 1.0), 1.0).unwrap();
        pca.add_image(gaussian_image(11, 3.5, 1.0), 1.0).unwrap();
        pca.analyze().unwrap();
        let values = pca.eigen_values();
        for pair in values.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }

    #[test]
    fn test_eigen_images_are_unit_norm() {
        let mut pca = ImagePca::new(true);
        pca.add_image(gaussian_image(11, 1.5, 7.0), 1.0).unwrap();
        pca.add_image(gaussian_image(11, 2.5, 3.0), 1.0).unwrap();
        pca.analyze().unwrap();
        for eigen in pca.eigen_images() {
            let norm: f64 = eigen.pixels().iter().map(|v| v * v).sum();
            if norm > 0.0 {
                assert!((norm - 1.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_empty_set_is_invalid() {
        let mut pca = ImagePca::new(false);
        assert!(matches!(pca.analyze(), Err(MeasError::InvalidArgument(_))));
    }

    #[test]
    fn test_mismatched_dimensions_rejected() {
        let mut pca = ImagePca::new(false);
        pca.add_image(Image::new(5, 5), 1.0).unwrap();
        assert!(matches!(
            pca.add_image(Image::new(7, 7), 1.0),
            Err(MeasError::InvalidArgument(_))
        ));
    }
}
