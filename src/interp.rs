//! 1-D interpolation support for defect repair.
//!
//! The 4-point symmetric estimates used when replacing a contaminated pixel
//! come from a 2nd-order local polynomial; the coefficients below are for
//! unit pixel spacing (axis-aligned) and sqrt(2) spacing (diagonal).

use crate::image::Pixel;
use crate::masked_image::{MaskPixel, MaskedImage};

/// Axis-aligned 4-point coefficients: estimate = c1*(v[-1] + v[+1]) + c2*(v[-2] + v[+2]).
pub const LPC_1_C1: f64 = 0.7737;
pub const LPC_1_C2: f64 = -0.2737;

/// Diagonal variant of the same estimate, for sqrt(2) sample spacing.
pub const LPC_1S2_C1: f64 = 0.7874;
pub const LPC_1S2_C2: f64 = -0.2874;

/// Expected bias of the minimum of two unit Gaussians, subtracted from the
/// adopted estimate when at least two directional estimates were usable.
pub const MIN_2GAUSSIAN_BIAS: f64 = 0.5642;

/// Long-range 1-D interpolation through (x, y) along a row (`horizontal`)
/// or a column, using the nearest pixels on either side whose mask has no
/// bit of `bad_mask` set. Returns `None` when no usable pixel exists in
/// that direction.
///
/// Coordinates are local to `mi`.
pub fn single_pixel<P: Pixel>(
    x: i32,
    y: i32,
    mi: &MaskedImage<P>,
    horizontal: bool,
    bad_mask: MaskPixel,
) -> Option<f64> {
    let limit = if horizontal {
        mi.width() as i32
    } else {
        mi.height() as i32
    };
    let good = |pos: i32| -> Option<f64> {
        let (px, py) = if horizontal { (pos, y) } else { (x, pos) };
        if mi.mask().get(px, py) & bad_mask == 0 {
            Some(mi.image().get(px, py).to_f64())
        } else {
            None
        }
    };

    let here = if horizontal { x } else { y };
    let mut low = None;
    for pos in (0..here).rev() {
        if let Some(v) = good(pos) {
            low = Some((here - pos, v));
            break;
        }
    }
    let mut high = None;
    for pos in here + 1..limit {
        if let Some(v) = good(pos) {
            high = Some((pos - here, v));
            break;
        }
    }

    match (low, high) {
        (Some((dl, vl)), Some((dh, vh))) => {
            // Linear interpolation weighted by distance to each good pixel.
            let (dl, dh) = (dl as f64, dh as f64);
            Some((vl * dh + vh * dl) / (dl + dh))
        }
        (Some((_, v)), None) | (None, Some((_, v))) => Some(v),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masked_image::MaskedImage;

    fn image_with_ramp() -> MaskedImage<f64> {
        let mut mi = MaskedImage::new(9, 9);
        for y in 0..9i32 {
            for x in 0..9i32 {
                mi.image_mut().set(x, y, x as f64);
                mi.variance_mut().set(x, y, 1.0);
            }
        }
        mi
    }

    #[test]
    fn test_single_pixel_interpolates_linearly() {
        let mi = image_with_ramp();
        // Neighbors at x=3 and x=5 bracket x=4 symmetrically.
        let v = single_pixel(4, 4, &mi, true, 0).unwrap();
        assert!((v - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_pixel_skips_masked_neighbors() {
        let mut mi = image_with_ramp();
        let bad = mi.planes().bit_mask("BAD").unwrap();
        mi.mask_mut().set(3, 4, bad);
        mi.mask_mut().set(5, 4, bad);
        // Nearest good pixels are x=2 (distance 2) and x=6 (distance 2).
        let v = single_pixel(4, 4, &mi, true, bad).unwrap();
        assert!((v - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_pixel_one_sided() {
        let mut mi = image_with_ramp();
        let bad = mi.planes().bit_mask("BAD").unwrap();
        for x in 0..4i32 {
            mi.mask_mut().set(x, 4, bad);
        }
        let v = single_pixel(3, 4, &mi, true, bad).unwrap();
        assert_eq!(v, 4.0);
    }

    #[test]
    fn test_single_pixel_all_bad() {
        let mut mi = image_with_ramp();
        let bad = mi.planes().bit_mask("BAD").unwrap();
        for x in 0..9i32 {
            mi.mask_mut().set(x, 4, bad);
        }
        assert!(single_pixel(4, 4, &mi, true, bad).is_none());
    }

    #[test]
    fn test_single_pixel_vertical() {
        let mut mi = MaskedImage::<f64>::new(9, 9);
        for y in 0..9i32 {
            for x in 0..9i32 {
                mi.image_mut().set(x, y, y as f64 * 2.0);
            }
        }
        let v = single_pixel(4, 4, &mi, false, 0).unwrap();
        assert!((v - 8.0).abs() < 1e-12);
    }
}
