//! Row-span footprints of detected objects.
//!
//! A [`Footprint`] is a value-owning list of inclusive horizontal spans in
//! the parent frame, plus a bounding box and a pixel count. Footprints do
//! not borrow from the image they were detected in.

use std::collections::BTreeSet;

use imageproc::rect::Rect;

use crate::image::Image;
use crate::masked_image::MaskPixel;

/// One maximal horizontal run of pixels: row `y`, columns `x0..=x1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub y: i32,
    pub x0: i32,
    pub x1: i32,
}

impl Span {
    pub fn width(&self) -> usize {
        (self.x1 - self.x0 + 1) as usize
    }
}

/// A set of pixels described as a list of row-spans.
#[derive(Debug, Clone, Default)]
pub struct Footprint {
    spans: Vec<Span>,
    bbox: Option<Rect>,
    npix: usize,
}

impl Footprint {
    pub fn new() -> Self {
        Footprint::default()
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn n_pix(&self) -> usize {
        self.npix
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn bbox(&self) -> Option<Rect> {
        self.bbox
    }

    pub fn add_span(&mut self, y: i32, x0: i32, x1: i32) {
        debug_assert!(x0 <= x1);
        self.spans.push(Span { y, x0, x1 });
        self.npix += (x1 - x0 + 1) as usize;
        self.update_bbox(y, x0, x1);
    }

    fn update_bbox(&mut self, y: i32, x0: i32, x1: i32) {
        let (left, top, right, bottom) = match self.bbox {
            Some(b) => (
                b.left().min(x0),
                b.top().min(y),
                b.right().max(x1),
                b.bottom().max(y),
            ),
            None => (x0, y, x1, y),
        };
        self.bbox = Some(
            Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32),
        );
    }

    /// Sort spans by (y, x0) and merge overlapping or abutting spans on the
    /// same row. Afterwards the spans are pairwise disjoint and the pixel
    /// count equals the sum of the span widths.
    pub fn normalize(&mut self) {
        if self.spans.is_empty() {
            return;
        }
        self.spans.sort_by_key(|s| (s.y, s.x0));
        let mut merged: Vec<Span> = Vec::with_capacity(self.spans.len());
        for span in self.spans.drain(..) {
            match merged.last_mut() {
                Some(last) if last.y == span.y && span.x0 <= last.x1 + 1 => {
                    last.x1 = last.x1.max(span.x1);
                }
                _ => merged.push(span),
            }
        }
        self.spans = merged;
        self.recompute();
    }

    fn recompute(&mut self) {
        self.npix = self.spans.iter().map(|s| s.width()).sum();
        self.bbox = None;
        let spans = std::mem::take(&mut self.spans);
        for s in &spans {
            self.update_bbox(s.y, s.x0, s.x1);
        }
        self.spans = spans;
    }

    /// Visit every pixel, span by span.
    pub fn for_each_pixel(&self, mut f: impl FnMut(i32, i32)) {
        for span in &self.spans {
            for x in span.x0..=span.x1 {
                f(x, span.y);
            }
        }
    }

    /// Dilate by `n` pixels of 8-connectivity.
    pub fn grown(&self, n: i32) -> Footprint {
        let mut pixels: BTreeSet<(i32, i32)> = BTreeSet::new();
        self.for_each_pixel(|x, y| {
            for dy in -n..=n {
                for dx in -n..=n {
                    pixels.insert((y + dy, x + dx));
                }
            }
        });
        footprint_from_pixels(&pixels)
    }
}

fn footprint_from_pixels(pixels: &BTreeSet<(i32, i32)>) -> Footprint {
    let mut out = Footprint::new();
    let mut run: Option<Span> = None;
    for &(y, x) in pixels {
        match run {
            Some(ref mut span) if span.y == y && x == span.x1 + 1 => span.x1 = x,
            _ => {
                if let Some(span) = run.take() {
                    out.add_span(span.y, span.x0, span.x1);
                }
                run = Some(Span { y, x0: x, x1: x });
            }
        }
    }
    if let Some(span) = run {
        out.add_span(span.y, span.x0, span.x1);
    }
    out
}

/// The sub-footprint of pixels whose mask has any of the given bits set.
/// Pixels outside the mask image are ignored.
pub fn footprint_and_mask(
    footprint: &Footprint,
    mask: &Image<MaskPixel>,
    bits: MaskPixel,
) -> Footprint {
    let mut pixels: BTreeSet<(i32, i32)> = BTreeSet::new();
    footprint.for_each_pixel(|x, y| {
        let lx = x - mask.x0();
        let ly = y - mask.y0();
        if mask.contains(lx, ly) && mask.get(lx, ly) & bits != 0 {
            pixels.insert((y, x));
        }
    });
    footprint_from_pixels(&pixels)
}

/// OR the given bits into the mask under every footprint pixel. Pixels
/// outside the mask image are ignored.
pub fn set_mask_from_footprint(mask: &mut Image<MaskPixel>, footprint: &Footprint, bits: MaskPixel) {
    footprint.for_each_pixel(|x, y| {
        let lx = x - mask.x0();
        let ly = y - mask.y0();
        if mask.contains(lx, ly) {
            let m = mask.get(lx, ly);
            mask.set(lx, ly, m | bits);
        }
    });
}
