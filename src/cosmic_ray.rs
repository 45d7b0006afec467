//! Cosmic-ray detection and repair.
//!
//! Cosmic rays are found as pixels that stand out sharply against the means
//! of their directional neighbor pairs (more sharply than the PSF allows a
//! real source to), grouped into connected footprints, screened by a total
//! flux floor, and finally replaced by bias-corrected local interpolation.
//!
//! The detection scan intentionally overwrites each CR pixel with its
//! directional estimate as it goes; the replacement value is seen by the
//! neighborhood computations of pixels scanned later in the same pass,
//! which raises the detection rate for multi-pixel hits.

use std::f64::consts::PI;

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MeasError, Result};
use crate::footprint::{footprint_and_mask, set_mask_from_footprint, Footprint, Span};
use crate::interp::{
    single_pixel, LPC_1S2_C1, LPC_1S2_C2, LPC_1_C1, LPC_1_C2, MIN_2GAUSSIAN_BIAS,
};
use crate::image::Pixel;
use crate::masked_image::{MaskPixel, MaskedImage};
use crate::psf::Psf;

/// Tuning parameters for [`find_cosmic_rays`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrPolicy {
    /// Gain of the amplifier, electrons per DN. Must be positive.
    pub e_per_dn: f64,
    /// Threshold in sky sigma above the local neighbor means; a negative
    /// value means |min_sigma| is used as a raw DN floor instead.
    pub min_sigma: f64,
    /// Minimum total electrons for a CR candidate to be retained.
    pub min_e: f64,
    /// Noise-floor fiddle factor for the directional-contrast test.
    pub cond3_fac: f64,
    /// Scales PSF values to set the directional thresholds.
    pub cond3_fac2: f64,
    /// Number of growth iterations after the initial pass.
    pub niteration: usize,
}

impl Default for CrPolicy {
    fn default() -> Self {
        CrPolicy {
            e_per_dn: 1.0,
            min_sigma: 6.0,
            min_e: 150.0,
            cond3_fac: 2.5,
            cond3_fac2: 0.6,
            niteration: 3,
        }
    }
}

// A detected CR-contaminated pixel, in local image coordinates. `seq` is a
// ticket from a counter owned by the detection call; restoring in
// seq-reverse order makes the first-recorded value win when a pixel was
// recorded twice.
#[derive(Debug, Clone, Copy)]
struct CrPixel<P> {
    id: i32,
    col: i32,
    row: i32,
    val: P,
    seq: usize,
}

// A labeled run of CR pixels on one row, columns x0..=x1 inclusive.
#[derive(Debug, Clone, Copy)]
struct IdSpan {
    id: usize,
    y: i32,
    x0: i32,
    x1: i32,
}

// Follow a chain of aliases to the representative id, compressing the path
// behind us. Applying this twice gives the same answer as once.
fn resolve_alias(aliases: &mut [usize], id: usize) -> usize {
    let mut root = id;
    while aliases[root] != root {
        root = aliases[root];
    }
    let mut cur = id;
    while aliases[cur] != root {
        let next = aliases[cur];
        aliases[cur] = root;
        cur = next;
    }
    root
}

// PSF-derived thresholds for the directional-contrast test.
struct DirThresholds {
    ns: f64,
    we: f64,
    diag: f64,
}

// The directional-contrast test: does the sky-subtracted peak stand out
// against some direction's neighbor mean more sharply than the PSF allows?
// Directions are tried in the fixed order NS, WE, SW-NE, NW-SE and the
// first satisfied one supplies the estimate of the true pixel value.
#[allow(clippy::too_many_arguments)]
fn condition_3(
    peak: f64,
    mean_ns: f64,
    mean_we: f64,
    mean_swne: f64,
    mean_nwse: f64,
    dpeak: f64,
    dmean_ns: f64,
    dmean_we: f64,
    dmean_swne: f64,
    dmean_nwse: f64,
    thr: &DirThresholds,
    cond3_fac: f64,
) -> Option<f64> {
    if thr.ns * (peak - cond3_fac * dpeak) > mean_ns + cond3_fac * dmean_ns {
        return Some(mean_ns);
    }
    if thr.we * (peak - cond3_fac * dpeak) > mean_we + cond3_fac * dmean_we {
        return Some(mean_we);
    }
    if thr.diag * (peak - cond3_fac * dpeak) > mean_swne + cond3_fac * dmean_swne {
        return Some(mean_swne);
    }
    if thr.diag * (peak - cond3_fac * dpeak) > mean_nwse + cond3_fac * dmean_nwse {
        return Some(mean_nwse);
    }
    None
}

// Test one interior pixel. Returns the replacement value (sky reinstated)
// when the pixel is CR-contaminated. Coordinates are local; the caller
// guarantees a one-pixel interior margin.
fn is_cr_pixel<P: Pixel>(
    mi: &MaskedImage<P>,
    x: i32,
    y: i32,
    min_sigma: f64,
    thr: &DirThresholds,
    bkgd: f64,
    cond3_fac: f64,
) -> Option<f64> {
    let im = |dx: i32, dy: i32| mi.image().get(x + dx, y + dy).to_f64();
    let var = |dx: i32, dy: i32| mi.variance().get(x + dx, y + dy).to_f64();

    let v_00 = im(0, 0);
    if v_00 < 0.0 {
        return None;
    }
    let var_00 = var(0, 0);
    if var_00 < 0.0 {
        return None;
    }

    // Two-sided means of the surrounding pixels, by direction.
    let mean_we = (im(-1, 0) + im(1, 0)) / 2.0;
    let mean_ns = (im(0, -1) + im(0, 1)) / 2.0;
    let mean_swne = (im(-1, -1) + im(1, 1)) / 2.0;
    let mean_nwse = (im(-1, 1) + im(1, -1)) / 2.0;

    // Condition #2: contrast over the local background.
    if min_sigma < 0.0 {
        if v_00 < -min_sigma {
            return None;
        }
    } else {
        let thres_sky_sigma = min_sigma * var_00.sqrt();
        if v_00 < mean_ns + thres_sky_sigma
            || v_00 < mean_we + thres_sky_sigma
            || v_00 < mean_swne + thres_sky_sigma
            || v_00 < mean_nwse + thres_sky_sigma
        {
            return None;
        }
    }

    // Condition #3 works on sky-subtracted values.
    let dv_00 = var_00.sqrt();
    let dmean_we = (var(-1, 0) + var(1, 0)).sqrt() / 2.0;
    let dmean_ns = (var(0, -1) + var(0, 1)).sqrt() / 2.0;
    let dmean_swne = (var(-1, -1) + var(1, 1)).sqrt() / 2.0;
    let dmean_nwse = (var(-1, 1) + var(1, -1)).sqrt() / 2.0;

    condition_3(
        v_00 - bkgd,
        mean_ns - bkgd,
        mean_we - bkgd,
        mean_swne - bkgd,
        mean_nwse - bkgd,
        dv_00,
        dmean_ns,
        dmean_we,
        dmean_swne,
        dmean_nwse,
        thr,
        cond3_fac,
    )
    .map(|estimate| estimate + bkgd)
}

// Re-run the pixel test over the three rows covering a span (including the
// pixels just beyond its ends), extending `extras` with new detections.
// Newly found pixels are overwritten with their estimates as in the initial
// sweep; originals are recorded only when `keep` needs them back.
#[allow(clippy::too_many_arguments)]
fn check_span_for_crs<P: Pixel>(
    extras: &mut Footprint,
    crpixels: &mut Vec<CrPixel<P>>,
    seq: &mut usize,
    y: i32,
    x0: i32,
    x1: i32,
    mi: &mut MaskedImage<P>,
    min_sigma: f64,
    thr: &DirThresholds,
    bkgd: f64,
    cond3_fac: f64,
    keep: bool,
) {
    for x in x0 - 1..=x1 + 1 {
        if let Some(corr) = is_cr_pixel(mi, x, y, min_sigma, thr, bkgd, cond3_fac) {
            if keep {
                crpixels.push(CrPixel {
                    id: -1,
                    col: x,
                    row: y,
                    val: mi.image().get(x, y),
                    seq: *seq,
                });
                *seq += 1;
            }
            mi.image_mut().set(x, y, P::from_f64(corr));
            extras.add_span(y + mi.y0(), x + mi.x0(), x + mi.x0());
        }
    }
}

fn gauss_dev(rng: &mut impl Rng) -> f64 {
    // Box-Muller from two uniforms.
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

// The four 4-point interpolation geometries: support offsets at distance 1
// and 2 along the direction, with the matching polynomial coefficients.
struct InterpDirection {
    offsets: [(i32, i32); 4], // -2, -1, +1, +2 along the direction
    c1: f64,
    c2: f64,
}

const INTERP_DIRECTIONS: [InterpDirection; 4] = [
    // W-E row
    InterpDirection {
        offsets: [(-2, 0), (-1, 0), (1, 0), (2, 0)],
        c1: LPC_1_C1,
        c2: LPC_1_C2,
    },
    // N-S column
    InterpDirection {
        offsets: [(0, -2), (0, -1), (0, 1), (0, 2)],
        c1: LPC_1_C1,
        c2: LPC_1_C2,
    },
    // SW-NE diagonal
    InterpDirection {
        offsets: [(-2, -2), (-1, -1), (1, 1), (2, 2)],
        c1: LPC_1S2_C1,
        c2: LPC_1S2_C2,
    },
    // NW-SE diagonal
    InterpDirection {
        offsets: [(2, -2), (1, -1), (-1, 1), (-2, 2)],
        c1: LPC_1S2_C1,
        c2: LPC_1S2_C2,
    },
];

// Replace one CR pixel with the minimum acceptable 4-point estimate,
// falling back to long-range 1-D interpolation, and debiasing the minimum
// of several estimates by the two-Gaussian bias.
fn interpolate_over_pixel<P: Pixel>(
    mi: &mut MaskedImage<P>,
    x: i32,
    y: i32,
    bkgd: f64,
    bad_mask: MaskPixel,
    debias: bool,
    rng: &mut impl Rng,
) {
    let ncol = mi.width() as i32;
    let nrow = mi.height() as i32;
    let sd = mi.variance().get(x, y).to_f64().max(0.0).sqrt();
    let minval = bkgd - 2.0 * sd; // min acceptable value after interpolation

    let mut min = f64::INFINITY;
    let mut ngood = 0;
    for dir in &INTERP_DIRECTIONS {
        let in_bounds = dir
            .offsets
            .iter()
            .all(|&(dx, dy)| x + dx >= 0 && x + dx < ncol && y + dy >= 0 && y + dy < nrow);
        if !in_bounds {
            continue;
        }
        let contaminated = dir
            .offsets
            .iter()
            .any(|&(dx, dy)| mi.mask().get(x + dx, y + dy) & bad_mask != 0);
        if contaminated {
            continue;
        }
        let v = |i: usize| {
            let (dx, dy) = dir.offsets[i];
            mi.image().get(x + dx, y + dy).to_f64()
        };
        let tmp = dir.c1 * (v(1) + v(2)) + dir.c2 * (v(0) + v(3));
        if tmp > minval {
            ngood += 1;
            if tmp < min {
                min = tmp;
            }
        }
    }

    if ngood == 0 {
        // No acceptable 4-point estimate; interpolate over as large a
        // distance as required, along the row and the column, and average.
        let val_h = single_pixel(x, y, mi, true, bad_mask);
        let val_v = single_pixel(x, y, mi, false, bad_mask);
        min = match (val_h, val_v) {
            (Some(h), Some(v)) => (h + v) / 2.0,
            (Some(h), None) => h,
            (None, Some(v)) => v,
            (None, None) => bkgd + sd * gauss_dev(rng),
        };
    }

    // If more than one uncontaminated estimate was available, the minimum
    // carries the bias of the smaller of two Gaussian deviates.
    if debias && ngood > 1 {
        min -= MIN_2GAUSSIAN_BIAS * sd;
    }

    mi.image_mut().set(x, y, P::from_f64(min));
}

// Interpolate over all the CRs, in reverse footprint order. A CR whose
// grown footprint touches saturated pixels is not repaired; it is marked
// saturated instead. When `interp_bit` is given, repaired footprints get
// it set.
#[allow(clippy::too_many_arguments)]
fn remove_crs<P: Pixel>(
    mi: &mut MaskedImage<P>,
    crs: &[Footprint],
    bkgd: f64,
    satur_bit: MaskPixel,
    bad_mask: MaskPixel,
    debias: bool,
    grow: bool,
    interp_bit: Option<MaskPixel>,
    rng: &mut impl Rng,
) {
    let x0 = mi.x0();
    let y0 = mi.y0();
    for cr in crs.iter().rev() {
        if grow && cr.n_pix() < 100 {
            let gcr = cr.grown(1);
            let satur = footprint_and_mask(&gcr, mi.mask(), satur_bit);
            if satur.n_pix() > 0 {
                // Adjacent to a saturation trail: no repair, and the whole
                // grown region inherits the saturation flag.
                set_mask_from_footprint(mi.mask_mut(), &gcr, satur_bit);
                continue;
            }
        }
        cr.for_each_pixel(|px, py| {
            interpolate_over_pixel(mi, px - x0, py - y0, bkgd, bad_mask, debias, rng);
        });
        if let Some(bit) = interp_bit {
            set_mask_from_footprint(mi.mask_mut(), cr, bit);
        }
    }
}

/// Find cosmic rays in an image; mask them, and unless `keep` is set,
/// remove them by interpolation.
///
/// Returns one [`Footprint`] per cosmic ray, in the parent frame of the
/// image. Side effects on `mimage`: the `CR` mask bit is set for every CR
/// pixel; when `keep` is false the CR pixel values are replaced and the
/// `INTRP` bit is set where interpolation happened; when `keep` is true
/// the image plane is left exactly as it was.
pub fn find_cosmic_rays<P: Pixel>(
    mimage: &mut MaskedImage<P>,
    psf: &dyn Psf,
    bkgd: f64,
    policy: &CrPolicy,
    keep: bool,
) -> Result<Vec<Footprint>> {
    if policy.e_per_dn <= 0.0 {
        return Err(MeasError::InvalidArgument(format!(
            "e_per_dn must be positive, got {}",
            policy.e_per_dn
        )));
    }

    // Thresholds for the directional-contrast test.
    let thr = DirThresholds {
        ns: policy.cond3_fac2 * psf.value(1.0, 0.0),
        we: policy.cond3_fac2 * psf.value(0.0, 1.0),
        diag: policy.cond3_fac2 * psf.value(1.0, 1.0),
    };

    let planes = mimage.planes().clone();
    let cr_bit = planes.bit_mask("CR")?;
    let interp_bit = planes.bit_mask("INTRP")?;
    let satur_bit = planes.bit_mask("SAT")?;
    let sweep_mask = planes.bit_mask_of(&["BAD", "INTRP", "SAT"])?;
    let contaminated_mask = planes.bit_mask_of(&["BAD", "CR", "SAT", "INTRP"])?;

    let ncol = mimage.width() as i32;
    let nrow = mimage.height() as i32;
    let x0_im = mimage.x0();
    let y0_im = mimage.y0();

    let mut rng = rand::thread_rng();
    let mut seq = 0usize;
    let mut crpixels: Vec<CrPixel<P>> = Vec::new();

    // Initial sweep over the interior, replacing suspects as we go.
    for j in 1..nrow - 1 {
        for i in 1..ncol - 1 {
            let Some(corr) = is_cr_pixel(mimage, i, j, policy.min_sigma, &thr, bkgd, policy.cond3_fac)
            else {
                continue;
            };
            // Condition #4: already-bad pixels don't get to be CRs.
            if mimage.mask().get(i, j) & sweep_mask != 0 {
                continue;
            }
            crpixels.push(CrPixel {
                id: -1,
                col: i,
                row: j,
                val: mimage.image().get(i, j),
                seq,
            });
            seq += 1;
            mimage.image_mut().set(i, j, P::from_f64(corr));
        }
    }
    debug!("initial sweep found {} CR-contaminated pixels", crpixels.len());

    // Merge pixels into maximal horizontal runs, labeling connected runs
    // with a shared id through the alias table.
    crpixels.sort_by_key(|p| (p.row, p.col));
    let mut aliases: Vec<usize> = vec![0];
    let mut spans: Vec<IdSpan> = Vec::new();
    {
        let n = crpixels.len();
        let mut ncr = 0usize;
        let (mut y, mut x0, mut x1) = (0, 0, 0);
        for idx in 0..n {
            if crpixels[idx].id < 0 {
                ncr += 1;
                crpixels[idx].id = ncr as i32;
                aliases.push(ncr);
                y = crpixels[idx].row;
                x0 = crpixels[idx].col;
                x1 = x0;
            }
            let id = crpixels[idx].id as usize;
            let contiguous = idx + 1 < n
                && crpixels[idx + 1].row == crpixels[idx].row
                && crpixels[idx + 1].col == crpixels[idx].col + 1;
            if contiguous {
                crpixels[idx + 1].id = id as i32;
                x1 += 1;
            } else {
                spans.push(IdSpan { id, y, x0, x1 });
            }
        }
    }

    // Union ids of spans that touch (corner contact counts) on adjacent rows.
    for i in 0..spans.len() {
        let IdSpan { y, x0, x1, .. } = spans[i];
        for j in i + 1..spans.len() {
            if spans[j].y == y {
                continue;
            }
            if spans[j].y != y + 1 || spans[j].x0 > x1 + 1 {
                break;
            }
            if spans[j].x1 >= x0 - 1 {
                let a = resolve_alias(&mut aliases, spans[i].id);
                let b = resolve_alias(&mut aliases, spans[j].id);
                aliases[a] = b;
            }
        }
    }
    for span in spans.iter_mut() {
        span.id = resolve_alias(&mut aliases, span.id);
    }
    spans.sort_by_key(|s| (s.id, s.y, s.x0));

    // One footprint per id group, in the parent frame.
    let mut crs: Vec<Footprint> = Vec::new();
    let mut i0 = 0;
    while i0 < spans.len() {
        let id = spans[i0].id;
        let mut cr = Footprint::new();
        while i0 < spans.len() && spans[i0].id == id {
            let s = spans[i0];
            cr.add_span(s.y + y0_im, s.x0 + x0_im, s.x1 + x0_im);
            i0 += 1;
        }
        cr.normalize();
        crs.push(cr);
    }

    // Reinstate the original pixel values so the flux floor below sums
    // unmodified data.
    for crp in &crpixels {
        mimage.image_mut().set(crp.col, crp.row, crp.val);
    }

    // Condition #1: drop candidates below the counts floor.
    crs.retain(|cr| {
        let mut sum = 0.0;
        cr.for_each_pixel(|px, py| {
            sum += mimage.image().get(px - x0_im, py - y0_im).to_f64() - bkgd;
        });
        if let Some(bbox) = cr.bbox() {
            debug!("CR at ({}, {}) has {:.1} DN", bbox.left(), bbox.top(), sum);
        }
        sum * policy.e_per_dn >= policy.min_e
    });
    debug!("{} CRs survive the counts floor", crs.len());

    // First removal pass; no growing yet, and no INTRP bits so the growth
    // iterations below can still tell repaired CRs apart.
    remove_crs(
        mimage,
        &crs,
        bkgd,
        satur_bit,
        contaminated_mask,
        true,
        false,
        None,
        &mut rng,
    );

    // Look for additional contaminated pixels around each CR, at half the
    // detection threshold and with the noise fiddle factor off.
    for pass in 0..policy.niteration {
        let mut nextra = 0usize;
        for cr in crs.iter_mut() {
            let interped = footprint_and_mask(cr, mimage.mask(), interp_bit);
            if interped.n_pix() == cr.n_pix() {
                continue;
            }
            let mut extra = Footprint::new();
            let cr_spans: Vec<Span> = cr.spans().to_vec();
            for span in cr_spans {
                // A 3x3 test region around every span pixel needs a 2-pixel
                // margin in x (we also test just beyond the span ends) and
                // 1 in y.
                let y = span.y - y0_im;
                if y < 2 || y >= nrow - 2 || ncol < 5 {
                    continue;
                }
                let sx0 = (span.x0 - x0_im).clamp(2, ncol - 3);
                let sx1 = (span.x1 - x0_im).clamp(2, ncol - 3);
                for dy in -1..=1 {
                    check_span_for_crs(
                        &mut extra,
                        &mut crpixels,
                        &mut seq,
                        y + dy,
                        sx0,
                        sx1,
                        mimage,
                        policy.min_sigma / 2.0,
                        &thr,
                        bkgd,
                        0.0,
                        keep,
                    );
                }
            }
            if !extra.is_empty() {
                nextra += extra.n_pix();
                for s in extra.spans() {
                    cr.add_span(s.y, s.x0, s.x1);
                }
                cr.normalize();
            }
        }
        debug!("growth iteration {} added {} pixels", pass, nextra);
        if nextra == 0 {
            break;
        }
    }

    // Flag every CR pixel.
    for cr in &crs {
        set_mask_from_footprint(mimage.mask_mut(), cr, cr_bit);
    }

    if keep {
        // Put the original values back; reverse seq order makes the first
        // recorded value win for pixels recorded more than once.
        crpixels.sort_by_key(|p| p.seq);
        for crp in crpixels.iter().rev() {
            mimage.image_mut().set(crp.col, crp.row, crp.val);
        }
    } else {
        debug!("removing final list of {} CRs", crs.len());
        remove_crs(
            mimage,
            &crs,
            bkgd,
            satur_bit,
            contaminated_mask,
            true,
            true,
            Some(interp_bit),
            &mut rng,
        );
    }

    Ok(crs)
}
