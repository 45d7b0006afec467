//! Point-spread function abstraction, attribute statistics, and the PSF
//! factory registry.

use std::collections::HashMap;

use log::trace;

use crate::error::{MeasError, Result};
use crate::image::{offset_image, position_to_index, Image};
use crate::kernel::LinearCombinationKernel;

/// A point-spread function: the instrument's response to a point source,
/// with unit central amplitude.
pub trait Psf {
    /// Evaluate the PSF at an offset (dx, dy) from its centre.
    fn value(&self, dx: f64, dy: f64) -> f64;

    /// Width of pixel-grid realisations.
    fn width(&self) -> usize;

    /// Height of pixel-grid realisations.
    fn height(&self) -> usize;

    /// Realise the PSF on the pixel grid at position (x, y).
    ///
    /// The fractional part of the position is applied as a sub-pixel offset,
    /// with the centre within pixel (width/2, height/2); the image origin is
    /// set so it covers the right region of the parent frame.
    fn image(&self, x: f64, y: f64) -> Image<f64> {
        let (xi, dx) = position_to_index(x);
        let (yi, dy) = position_to_index(y);
        let xcen = self.width() as i32 / 2;
        let ycen = self.height() as i32 / 2;

        let mut out = Image::new(self.width(), self.height());
        for iy in 0..self.height() as i32 {
            for ix in 0..self.width() as i32 {
                let v = self.value((ix - xcen) as f64 - dx, (iy - ycen) as f64 - dy);
                out.set(ix, iy, v);
            }
        }
        out.set_xy0(xi - xcen, yi - ycen);
        out
    }
}

/// A PSF backed by a (possibly spatially varying) linear-combination kernel.
pub struct KernelPsf {
    kernel: LinearCombinationKernel,
}

impl KernelPsf {
    pub fn new(kernel: LinearCombinationKernel) -> Self {
        KernelPsf { kernel }
    }

    pub fn kernel(&self) -> &LinearCombinationKernel {
        &self.kernel
    }
}

impl Psf for KernelPsf {
    fn value(&self, dx: f64, dy: f64) -> f64 {
        let im = self.kernel.compute_image(0.0, 0.0);
        let (cx, cy) = self.kernel.ctr();
        let x = cx + dx.round() as i32;
        let y = cy + dy.round() as i32;
        if im.contains(x, y) {
            let peak = im.get(cx, cy);
            if peak != 0.0 {
                im.get(x, y) / peak
            } else {
                im.get(x, y)
            }
        } else {
            0.0
        }
    }

    fn width(&self) -> usize {
        self.kernel.width()
    }

    fn height(&self) -> usize {
        self.kernel.height()
    }

    fn image(&self, x: f64, y: f64) -> Image<f64> {
        let (xi, dx) = position_to_index(x);
        let (yi, dy) = position_to_index(y);
        let (cx, cy) = self.kernel.ctr();
        let mut im = offset_image(&self.kernel.compute_image(x, y), dx, dy);
        im.set_xy0(xi - cx, yi - cy);
        im
    }
}

/// Builds PSFs of one variety from (width, height, p0, p1, p2).
pub type PsfFactory = Box<dyn Fn(usize, usize, f64, f64, f64) -> Result<Box<dyn Psf>>>;

/// An explicit name-to-factory registry.
///
/// The registry is populated once at startup and read-only afterwards; it is
/// owned by the measurement context rather than living in process-wide
/// state.
#[derive(Default)]
pub struct PsfRegistry {
    factories: HashMap<String, PsfFactory>,
}

impl PsfRegistry {
    pub fn new() -> Self {
        PsfRegistry::default()
    }

    /// Declare a factory for a variety. Redeclaring a name is an error.
    pub fn declare(&mut self, name: &str, factory: PsfFactory) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(MeasError::InvalidArgument(format!(
                "PSF variety \"{}\" is already declared",
                name
            )));
        }
        trace!("declaring PSF variety {}", name);
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// Look up the factory for a variety.
    pub fn lookup(&self, name: &str) -> Result<&PsfFactory> {
        self.factories
            .get(name)
            .ok_or_else(|| MeasError::NotFound(format!("PSF variety \"{}\"", name)))
    }

    /// Create a PSF of the requested variety.
    pub fn create(
        &self,
        name: &str,
        width: usize,
        height: usize,
        p0: f64,
        p1: f64,
        p2: f64,
    ) -> Result<Box<dyn Psf>> {
        self.lookup(name)?(width, height, p0, p1, p2)
    }
}

/// Shape statistics of a PSF realised at one position.
pub struct PsfAttributes {
    psf_image: Image<f64>,
}

impl PsfAttributes {
    pub fn new(psf: &dyn Psf, x: f64, y: f64) -> Self {
        PsfAttributes {
            psf_image: psf.image(x, y),
        }
    }

    fn moments(&self, radial_power: u32) -> (f64, f64) {
        let xcen = (self.psf_image.width() / 2) as f64;
        let ycen = (self.psf_image.height() / 2) as f64;
        let mut sum = 0.0;
        let mut norm = 0.0;
        for iy in 0..self.psf_image.height() as i32 {
            for ix in 0..self.psf_image.width() as i32 {
                let v = self.psf_image.get(ix, iy);
                let dx = ix as f64 - xcen;
                let dy = iy as f64 - ycen;
                let r = (dx * dx + dy * dy).sqrt();
                sum += v * r.powi(radial_power as i32);
                norm += v;
            }
        }
        (sum, norm)
    }

    /// The sigma of an equivalent Gaussian: sqrt(sum((I*r)^2) / sum(I^2)).
    pub fn gaussian_width(&self) -> f64 {
        let mut sum = 0.0;
        let mut norm = 0.0;
        for iy in 0..self.psf_image.height() as i32 {
            for ix in 0..self.psf_image.width() as i32 {
                let v = self.psf_image.get(ix, iy);
                let dx = ix as f64 - (self.psf_image.width() / 2) as f64;
                let dy = iy as f64 - (self.psf_image.height() / 2) as f64;
                let m = v * (dx * dx + dy * dy).sqrt();
                sum += m * m;
                norm += v * v;
            }
        }
        (sum / norm).sqrt()
    }

    /// First radial moment: sum(I*r) / sum(I).
    ///
    /// For a Gaussian N(0, alpha^2), <r> = sqrt(pi/2)*alpha.
    pub fn first_moment(&self) -> Result<f64> {
        let (sum, norm) = self.moments(1);
        check_moment(sum, norm, "sum(I*r)")?;
        Ok(sum / norm)
    }

    /// Second radial moment: sum(I*r^2) / sum(I).
    ///
    /// For a Gaussian N(0, alpha^2), <r^2> = 2*alpha^2.
    pub fn second_moment(&self) -> Result<f64> {
        let (sum, norm) = self.moments(2);
        check_moment(sum, norm, "sum(I*r*r)")?;
        Ok(sum / norm)
    }

    /// Effective area: (sum(I))^2 / sum(I^2).
    pub fn effective_area(&self) -> f64 {
        let mut sum = 0.0;
        let mut sumsqr = 0.0;
        for v in self.psf_image.pixels() {
            sum += v;
            sumsqr += v * v;
        }
        sum * sum / sumsqr
    }
}

fn check_moment(sum: f64, norm: f64, what: &str) -> Result<()> {
    let mut errmsg = String::new();
    if sum < 0.0 {
        errmsg = format!("{} is negative.  ", what);
    }
    if norm <= 0.0 {
        errmsg += "sum(I) is <= 0.";
    }
    if !errmsg.is_empty() {
        return Err(MeasError::Domain(errmsg));
    }
    Ok(())
}
