//! Image / variance / mask triples.
//!
//! A [`MaskedImage`] carries, at every pixel, a floating-point intensity, a
//! non-negative variance (zero meaning "infinite variance": the sample is
//! skipped in weighted sums), and an integer bitfield of named planes.

use std::collections::HashMap;

use crate::error::{MeasError, Result};
use crate::image::{Image, Pixel};

/// Storage type of the mask plane.
pub type MaskPixel = u16;

/// Mapping from mask plane names to bit positions.
///
/// The default planes are part of the library's contract: `BAD`, `SAT`,
/// `INTRP`, `CR` and `DETECTED`.
#[derive(Debug, Clone)]
pub struct MaskPlanes {
    planes: HashMap<String, u32>,
}

impl Default for MaskPlanes {
    fn default() -> Self {
        let mut planes = HashMap::new();
        for (i, name) in ["BAD", "SAT", "INTRP", "CR", "DETECTED"].iter().enumerate() {
            planes.insert((*name).to_string(), i as u32);
        }
        MaskPlanes { planes }
    }
}

impl MaskPlanes {
    /// The bit mask for a single named plane.
    pub fn bit_mask(&self, name: &str) -> Result<MaskPixel> {
        self.planes
            .get(name)
            .map(|bit| 1 << bit)
            .ok_or_else(|| MeasError::NotFound(format!("mask plane \"{}\"", name)))
    }

    /// The union of the bit masks of several named planes.
    pub fn bit_mask_of(&self, names: &[&str]) -> Result<MaskPixel> {
        let mut mask = 0;
        for name in names {
            mask |= self.bit_mask(name)?;
        }
        Ok(mask)
    }
}

/// A rectangular raster of (image, variance, mask) pixels with an integer
/// origin in its parent frame.
#[derive(Debug, Clone)]
pub struct MaskedImage<P> {
    image: Image<P>,
    variance: Image<P>,
    mask: Image<MaskPixel>,
    planes: MaskPlanes,
}

impl Pixel for MaskPixel {
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as MaskPixel
    }
}

impl<P: Pixel> MaskedImage<P> {
    pub fn new(width: usize, height: usize) -> Self {
        MaskedImage {
            image: Image::new(width, height),
            variance: Image::new(width, height),
            mask: Image::new(width, height),
            planes: MaskPlanes::default(),
        }
    }

    pub fn width(&self) -> usize {
        self.image.width()
    }

    pub fn height(&self) -> usize {
        self.image.height()
    }

    pub fn x0(&self) -> i32 {
        self.image.x0()
    }

    pub fn y0(&self) -> i32 {
        self.image.y0()
    }

    pub fn set_xy0(&mut self, x0: i32, y0: i32) {
        self.image.set_xy0(x0, y0);
        self.variance.set_xy0(x0, y0);
        self.mask.set_xy0(x0, y0);
    }

    pub fn image(&self) -> &Image<P> {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Image<P> {
        &mut self.image
    }

    pub fn variance(&self) -> &Image<P> {
        &self.variance
    }

    pub fn variance_mut(&mut self) -> &mut Image<P> {
        &mut self.variance
    }

    pub fn mask(&self) -> &Image<MaskPixel> {
        &self.mask
    }

    pub fn mask_mut(&mut self) -> &mut Image<MaskPixel> {
        &mut self.mask
    }

    pub fn planes(&self) -> &MaskPlanes {
        &self.planes
    }

    /// Deep-copy a sub-rectangle given in local coordinates; the copy keeps
    /// the parent-frame origin of the region it covers.
    pub fn subimage(&self, left: i32, top: i32, width: usize, height: usize) -> Result<MaskedImage<P>> {
        Ok(MaskedImage {
            image: self.image.subimage(left, top, width, height)?,
            variance: self.variance.subimage(left, top, width, height)?,
            mask: self.mask.subimage(left, top, width, height)?,
            planes: self.planes.clone(),
        })
    }
}
