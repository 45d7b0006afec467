//! Star postage-stamp candidates arranged in a spatial grid of cells.
//!
//! Candidate traversal is deterministic: cells in row-major order, and
//! candidates inside a cell by flux descending. Visitors are plain
//! closures.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use imageproc::rect::Rect;

use crate::error::{MeasError, Result};
use crate::image::{position_to_index, Pixel};
use crate::masked_image::MaskedImage;

/// Default postage-stamp side length.
pub const DEFAULT_STAMP_SIZE: usize = 15;

/// A star postage-stamp: a window into a parent image centred on a star,
/// with cached fit state.
#[derive(Debug)]
pub struct PsfCandidate<P: Pixel> {
    parent: Rc<MaskedImage<P>>,
    x_center: f64,
    y_center: f64,
    width: usize,
    height: usize,
    flux: f64,
    stamp: RefCell<Option<Rc<MaskedImage<P>>>>,
    var: Cell<f64>,
    chi2: Cell<f64>,
    amplitude: Cell<f64>,
}

impl<P: Pixel> PsfCandidate<P> {
    pub fn new(parent: Rc<MaskedImage<P>>, x_center: f64, y_center: f64, flux: f64) -> Self {
        PsfCandidate {
            parent,
            x_center,
            y_center,
            width: DEFAULT_STAMP_SIZE,
            height: DEFAULT_STAMP_SIZE,
            flux,
            stamp: RefCell::new(None),
            var: Cell::new(f64::NAN),
            chi2: Cell::new(f64::NAN),
            amplitude: Cell::new(f64::NAN),
        }
    }

    pub fn x_center(&self) -> f64 {
        self.x_center
    }

    pub fn y_center(&self) -> f64 {
        self.y_center
    }

    pub fn flux(&self) -> f64 {
        self.flux
    }

    pub fn stamp_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Change the stamp size, invalidating any cached stamp.
    pub fn set_stamp_size(&mut self, width: usize, height: usize) {
        if width != self.width || height != self.height {
            self.width = width;
            self.height = height;
            self.stamp.replace(None);
        }
    }

    /// The candidate's postage stamp, centred in a pixel, extracted (and
    /// cached) from the parent image. Fails with an out-of-bounds error
    /// when the stamp would fall off the parent.
    pub fn image(&self) -> Result<Rc<MaskedImage<P>>> {
        if let Some(stamp) = self.stamp.borrow().as_ref() {
            return Ok(Rc::clone(stamp));
        }
        let (xi, _) = position_to_index(self.x_center);
        let (yi, _) = position_to_index(self.y_center);
        let left = xi - self.width as i32 / 2 - self.parent.x0();
        let top = yi - self.height as i32 / 2 - self.parent.y0();
        if left < 0
            || top < 0
            || left as usize + self.width > self.parent.width()
            || top as usize + self.height > self.parent.height()
        {
            return Err(MeasError::OutOfBounds(format!(
                "stamp {}x{} at ({:.1}, {:.1}) exceeds parent image",
                self.width, self.height, self.x_center, self.y_center
            )));
        }
        let stamp = Rc::new(self.parent.subimage(left, top, self.width, self.height)?);
        let var_sum: f64 = stamp.variance().pixels().iter().map(|v| v.to_f64()).sum();
        self.var.set(var_sum / (self.width * self.height) as f64);
        *self.stamp.borrow_mut() = Some(Rc::clone(&stamp));
        Ok(stamp)
    }

    /// Mean variance of the stamp pixels, available once the stamp has been
    /// extracted.
    pub fn var(&self) -> f64 {
        self.var.get()
    }

    pub fn chi2(&self) -> f64 {
        self.chi2.get()
    }

    pub fn set_chi2(&self, chi2: f64) {
        self.chi2.set(chi2);
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude.get()
    }

    pub fn set_amplitude(&self, amplitude: f64) {
        self.amplitude.set(amplitude);
    }
}

#[derive(Debug)]
struct SpatialCell<P: Pixel> {
    candidates: Vec<PsfCandidate<P>>,
}

impl<P: Pixel> Default for SpatialCell<P> {
    fn default() -> Self {
        SpatialCell {
            candidates: Vec::new(),
        }
    }
}

/// A 2-D grid of cells over a region, each holding candidates ordered by
/// flux descending.
#[derive(Debug)]
pub struct SpatialCellSet<P: Pixel> {
    region: Rect,
    cell_width: usize,
    cell_height: usize,
    nx: usize,
    ny: usize,
    cells: Vec<SpatialCell<P>>,
}

impl<P: Pixel> SpatialCellSet<P> {
    pub fn new(region: Rect, cell_width: usize, cell_height: usize) -> Result<Self> {
        if cell_width == 0 || cell_height == 0 {
            return Err(MeasError::InvalidArgument(
                "cell dimensions must be positive".to_string(),
            ));
        }
        let nx = (region.width() as usize).div_ceil(cell_width);
        let ny = (region.height() as usize).div_ceil(cell_height);
        let mut cells = Vec::with_capacity(nx * ny);
        cells.resize_with(nx * ny, SpatialCell::default);
        Ok(SpatialCellSet {
            region,
            cell_width,
            cell_height,
            nx,
            ny,
            cells,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Insert a candidate into the cell containing its centroid.
    pub fn insert_candidate(&mut self, candidate: PsfCandidate<P>) -> Result<()> {
        let (xi, _) = position_to_index(candidate.x_center());
        let (yi, _) = position_to_index(candidate.y_center());
        if xi < self.region.left()
            || xi > self.region.right()
            || yi < self.region.top()
            || yi > self.region.bottom()
        {
            return Err(MeasError::OutOfBounds(format!(
                "candidate at ({:.1}, {:.1}) outside cell-set region",
                candidate.x_center(),
                candidate.y_center()
            )));
        }
        let cx = (xi - self.region.left()) as usize / self.cell_width;
        let cy = (yi - self.region.top()) as usize / self.cell_height;
        let cell = &mut self.cells[cy * self.nx + cx];
        let pos = cell
            .candidates
            .partition_point(|c| c.flux() >= candidate.flux());
        cell.candidates.insert(pos, candidate);
        Ok(())
    }

    /// Visit up to `n_per_cell` candidates in every cell; `n_per_cell <= 0`
    /// visits all of them.
    pub fn visit_candidates(&self, n_per_cell: i32, mut f: impl FnMut(&PsfCandidate<P>)) {
        for cell in &self.cells {
            let limit = per_cell_limit(n_per_cell, cell.candidates.len());
            for candidate in &cell.candidates[..limit] {
                f(candidate);
            }
        }
    }

    /// Mutable variant of [`visit_candidates`](Self::visit_candidates).
    pub fn visit_candidates_mut(&mut self, n_per_cell: i32, mut f: impl FnMut(&mut PsfCandidate<P>)) {
        for cell in &mut self.cells {
            let limit = per_cell_limit(n_per_cell, cell.candidates.len());
            for candidate in &mut cell.candidates[..limit] {
                f(candidate);
            }
        }
    }
}

fn per_cell_limit(n_per_cell: i32, available: usize) -> usize {
    if n_per_cell <= 0 {
        available
    } else {
        available.min(n_per_cell as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(width: usize, height: usize) -> Rc<MaskedImage<f32>> {
        let mut mi = MaskedImage::new(width, height);
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                mi.image_mut().set(x, y, (y as f32) * 100.0 + x as f32);
                mi.variance_mut().set(x, y, 2.0);
            }
        }
        Rc::new(mi)
    }

    #[test]
    fn test_stamp_extraction_and_cache() {
        let cand = PsfCandidate::new(parent(40, 40), 20.0, 20.0, 1.0);
        let stamp = cand.image().unwrap();
        assert_eq!(stamp.width(), DEFAULT_STAMP_SIZE);
        assert_eq!(stamp.x0(), 20 - 7);
        // Centre pixel of the stamp is the parent pixel under the centroid.
        assert_eq!(stamp.image().get(7, 7), 20.0 * 100.0 + 20.0);
        assert!((cand.var() - 2.0).abs() < 1e-12);
        // Second call returns the cached stamp.
        let again = cand.image().unwrap();
        assert!(Rc::ptr_eq(&stamp, &again));
    }

    #[test]
    fn test_stamp_off_the_edge() {
        let cand = PsfCandidate::new(parent(40, 40), 2.0, 20.0, 1.0);
        assert!(matches!(cand.image(), Err(MeasError::OutOfBounds(_))));
    }

    #[test]
    fn test_set_stamp_size_invalidates_cache() {
        let mut cand = PsfCandidate::new(parent(40, 40), 20.0, 20.0, 1.0);
        cand.image().unwrap();
        cand.set_stamp_size(11, 11);
        let stamp = cand.image().unwrap();
        assert_eq!(stamp.width(), 11);
    }

    #[test]
    fn test_visit_order_and_limit() {
        let region = Rect::at(0, 0).of_size(40, 40);
        let mut cells = SpatialCellSet::new(region, 20, 20).unwrap();
        let p = parent(40, 40);
        // Two candidates in the same cell, inserted faint-first.
        cells
            .insert_candidate(PsfCandidate::new(Rc::clone(&p), 5.0, 5.0, 10.0))
            .unwrap();
        cells
            .insert_candidate(PsfCandidate::new(Rc::clone(&p), 10.0, 5.0, 50.0))
            .unwrap();
        // One in a later cell.
        cells
            .insert_candidate(PsfCandidate::new(Rc::clone(&p), 30.0, 30.0, 30.0))
            .unwrap();

        let mut fluxes = Vec::new();
        cells.visit_candidates(0, |c| fluxes.push(c.flux()));
        assert_eq!(fluxes, vec![50.0, 10.0, 30.0]);

        let mut limited = Vec::new();
        cells.visit_candidates(1, |c| limited.push(c.flux()));
        assert_eq!(limited, vec![50.0, 30.0]);
    }

    #[test]
    fn test_insert_outside_region() {
        let region = Rect::at(0, 0).of_size(40, 40);
        let mut cells = SpatialCellSet::<f32>::new(region, 20, 20).unwrap();
        let p = parent(40, 40);
        assert!(matches!(
            cells.insert_candidate(PsfCandidate::new(p, 100.0, 5.0, 1.0)),
            Err(MeasError::OutOfBounds(_))
        ));
    }
}
