//! Spatially varying PSF models built from star postage-stamps.
//!
//! [`create_kernel_from_psf_candidates`] runs a weighted PCA over the
//! candidate stamps and assembles a [`LinearCombinationKernel`] whose
//! per-basis weights are 2-D polynomials in position. The polynomial
//! coefficients are then fit either by solving the normal equations
//! directly ([`fit_spatial_kernel`] with `do_nonlinear_fit = false`) or by
//! a Levenberg-Marquardt minimizer over the profiled chi-squared
//! ([`fit_spatial_kernel_from_psf_candidates`]).

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::{MeasError, Result};
use crate::image::{inner_product, offset_image, position_to_index, Image, Pixel};
use crate::kernel::{LinearCombinationKernel, PolynomialFunction2};
use crate::masked_image::MaskedImage;
use crate::pca::ImagePca;
use crate::psf::Psf;
use crate::spatial_cell::SpatialCellSet;

/// Border width excluded from stamp inner products.
const CANDIDATE_BORDER: usize = 0;

/// Fit a scalar amplitude of `model` to `data` in the least-squares sense,
/// weighting each pixel by its inverse variance. Zero-variance pixels are
/// skipped. Returns (chi2, amplitude).
fn fit_kernel_image<P: Pixel>(model: &Image<f64>, data: &MaskedImage<P>) -> Result<(f64, f64)> {
    if model.width() != data.width() || model.height() != data.height() {
        return Err(MeasError::InvalidArgument(format!(
            "model {}x{} does not match data {}x{}",
            model.width(),
            model.height(),
            data.width(),
            data.height()
        )));
    }
    let mut sum_mm = 0.0;
    let mut sum_md = 0.0;
    let mut sum_dd = 0.0;
    for y in 0..data.height() as i32 {
        for x in 0..data.width() as i32 {
            let m = model.get(x, y);
            let d = data.image().get(x, y).to_f64();
            let var = data.variance().get(x, y).to_f64();
            if var != 0.0 {
                let ivar = 1.0 / var;
                sum_mm += m * m * ivar;
                sum_md += m * d * ivar;
                sum_dd += d * d * ivar;
            }
        }
    }
    if sum_mm == 0.0 {
        return Err(MeasError::Range("sum(model^2)/var == 0".to_string()));
    }
    let amp = sum_md / sum_mm;
    let chi2 = sum_dd - 2.0 * amp * sum_md + amp * amp * sum_mm;
    Ok((chi2, amp))
}

/// Evaluate the kernel against up to `n_per_cell` candidates per cell
/// (all of them when `n_per_cell <= 0`), caching each candidate's chi2 and
/// best-fit amplitude, and return the total chi2. Candidates whose stamp
/// cannot be extracted are skipped.
fn evaluate_candidates<P: Pixel>(
    kernel: &LinearCombinationKernel,
    cells: &SpatialCellSet<P>,
    n_per_cell: i32,
) -> Result<f64> {
    let mut total = 0.0;
    let mut failure: Option<MeasError> = None;
    cells.visit_candidates(n_per_cell, |cand| {
        if failure.is_some() {
            return;
        }
        let Ok(data) = cand.image() else {
            return;
        };
        let kimage = kernel.compute_image(cand.x_center(), cand.y_center());
        match fit_kernel_image(&kimage, &data) {
            Ok((chi2, amp)) => {
                cand.set_chi2(chi2);
                cand.set_amplitude(amp);
                total += chi2;
            }
            Err(e) => failure = Some(e.at_position(cand.x_center(), cand.y_center())),
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(total),
    }
}

/// Number of candidates whose postage stamps are extractable, honoring the
/// per-cell limit.
pub fn count_psf_candidates<P: Pixel>(cells: &SpatialCellSet<P>, n_star_per_cell: i32) -> usize {
    let mut n = 0;
    cells.visit_candidates(n_star_per_cell, |cand| {
        if cand.image().is_ok() {
            n += 1;
        }
    });
    n
}

/// Analyze the candidate stamps and return a spatially varying kernel whose
/// basis is the leading eigen-images, together with the full eigenvalue
/// list (descending).
///
/// Stamps are recentered onto the pixel grid with a Lanczos-5 resampler
/// before entering the PCA; each kept eigen-image then has the mean of its
/// outer border subtracted, so a variable background cannot couple into
/// the PSF shape. The kernel starts out spatially constant: component 0
/// has unit weight everywhere, the rest are zero.
pub fn create_kernel_from_psf_candidates<P: Pixel>(
    cells: &mut SpatialCellSet<P>,
    n_eigen_components: i32,
    spatial_order: usize,
    ksize: usize,
    n_star_per_cell: i32,
    constant_weight: bool,
) -> Result<(LinearCombinationKernel, Vec<f64>)> {
    cells.visit_candidates_mut(0, |cand| cand.set_stamp_size(ksize, ksize));

    let mut pca = ImagePca::new(constant_weight);
    let mut failure: Option<MeasError> = None;
    cells.visit_candidates(n_star_per_cell, |cand| {
        if failure.is_some() {
            return;
        }
        let Ok(stamp) = cand.image() else {
            return; // stamp falls off the parent image
        };
        let (_, dx) = position_to_index(cand.x_center());
        let (_, dy) = position_to_index(cand.y_center());
        let recentered = offset_image(&stamp.image().to_f64_image(), -dx, -dy);
        if let Err(e) = pca.add_image(recentered, cand.flux()) {
            failure = Some(e);
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    pca.analyze()?;

    let eigen_values = pca.eigen_values().to_vec();
    let n_eigen = eigen_values.len() as i32;
    let ncomp = if n_eigen_components <= 0 || n_eigen < n_eigen_components {
        n_eigen as usize
    } else {
        n_eigen_components as usize
    };

    let mut basis: Vec<Image<f64>> = pca.eigen_images()[..ncomp].to_vec();
    for im in basis.iter_mut() {
        subtract_border_mean(im);
    }

    let mut spatial = Vec::with_capacity(ncomp);
    for i in 0..ncomp {
        let mut f = PolynomialFunction2::new(spatial_order);
        if i == 0 {
            f.set_parameter(0, 1.0);
        }
        spatial.push(f);
    }
    let kernel = LinearCombinationKernel::new(basis, spatial)?;
    debug!(
        "built {}-component spatial kernel from {} candidate stamps",
        ncomp,
        pca.n_images()
    );
    Ok((kernel, eigen_values))
}

// Subtract the mean of the outer border frame, of width min(2, w, h), so a
// variable background level does not couple into the component shape.
fn subtract_border_mean(im: &mut Image<f64>) {
    let border = 2.min(im.width()).min(im.height());
    let w = im.width() as i32;
    let h = im.height() as i32;
    let b = border as i32;
    let mut sum = 0.0;
    let mut n = 0usize;
    for y in 0..h {
        for x in 0..w {
            if x < b || x >= w - b || y < b || y >= h - b {
                sum += im.get(x, y);
                n += 1;
            }
        }
    }
    if n > 0 {
        im.offset_values(-sum / n as f64);
    }
}

/// Fit the kernel's spatial coefficients, linearly or by the nonlinear
/// minimizer, and return (is_valid, chi2).
pub fn fit_spatial_kernel<P: Pixel>(
    kernel: &mut LinearCombinationKernel,
    cells: &SpatialCellSet<P>,
    do_nonlinear_fit: bool,
    n_star_per_cell: i32,
    tolerance: f64,
) -> Result<(bool, f64)> {
    if do_nonlinear_fit {
        fit_spatial_kernel_from_psf_candidates(kernel, cells, n_star_per_cell, tolerance)
    } else {
        fit_spatial_kernel_linear(kernel, cells, n_star_per_cell, 0.0)
    }
}

// Assemble the normal equations A x = b over the flattened spatial
// coefficients. Each candidate contributes with weight 1/(var + tau2); its
// amplitude must already hold the closed-form best fit.
fn assemble_normal_equations<P: Pixel>(
    kernel: &LinearCombinationKernel,
    cells: &SpatialCellSet<P>,
    n_star_per_cell: i32,
    tau2: f64,
) -> Result<(DMatrix<f64>, DVector<f64>)> {
    let nc = kernel.n_basis();
    let ns = kernel.n_spatial_parameters();
    let nt = nc * ns;

    let basis = kernel.basis_images();
    let mut basis_dot_basis = DMatrix::<f64>::zeros(nc, nc);
    for i in 0..nc {
        for j in i..nc {
            let dot = inner_product(&basis[i], &basis[j], CANDIDATE_BORDER)?;
            basis_dot_basis[(i, j)] = dot;
            basis_dot_basis[(j, i)] = dot;
        }
    }

    let mut a = DMatrix::<f64>::zeros(nt, nt);
    let mut b = DVector::<f64>::zeros(nt);
    let mut failure: Option<MeasError> = None;
    cells.visit_candidates(n_star_per_cell, |cand| {
        if failure.is_some() {
            return;
        }
        let Ok(data) = cand.image() else {
            return;
        };
        let amp = cand.amplitude();
        if !amp.is_finite() || amp == 0.0 {
            debug!(
                "skipping candidate at ({:.1}, {:.1}) with amplitude {}",
                cand.x_center(),
                cand.y_center(),
                amp
            );
            return;
        }
        let ivar = 1.0 / (cand.var() + tau2);
        if !ivar.is_finite() {
            return;
        }
        // The derivative of every spatial polynomial with respect to its
        // coefficients is the same monomial vector.
        let monomials = kernel.spatial_functions()[0].basis(cand.x_center(), cand.y_center());

        for ic in 0..nc {
            let basis_dot_data = match inner_product(&basis[ic], data.image(), CANDIDATE_BORDER) {
                Ok(d) => d,
                Err(e) => {
                    failure = Some(e.at_position(cand.x_center(), cand.y_center()));
                    return;
                }
            };
            for is in 0..ns {
                let i = ic * ns + is;
                b[i] += ivar * monomials[is] * basis_dot_data / amp;
                for jc in 0..nc {
                    for js in 0..ns {
                        let j = jc * ns + js;
                        if j < i {
                            continue;
                        }
                        let term =
                            ivar * monomials[is] * monomials[js] * basis_dot_basis[(ic, jc)];
                        a[(i, j)] += term;
                        if i != j {
                            a[(j, i)] += term;
                        }
                    }
                }
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok((a, b)),
    }
}

// Linear fit: closed-form amplitudes, then one symmetric solve.
fn fit_spatial_kernel_linear<P: Pixel>(
    kernel: &mut LinearCombinationKernel,
    cells: &SpatialCellSet<P>,
    n_star_per_cell: i32,
    tau2: f64,
) -> Result<(bool, f64)> {
    // Seed every candidate's amplitude with the closed-form fit of the
    // current kernel before assembling the equations.
    evaluate_candidates(kernel, cells, n_star_per_cell)?;

    let (a, b) = assemble_normal_equations(kernel, cells, n_star_per_cell, tau2)?;
    let x = solve_symmetric(&a, &b)?;
    kernel.set_spatial_parameters(x.as_slice())?;

    // One more pass through all the candidates, caching their chi2 under
    // the fitted kernel.
    let chi2 = evaluate_candidates(kernel, cells, 0)?;
    Ok((true, chi2))
}

// A is symmetric positive semidefinite by construction; try Cholesky and
// fall back to LU for the semidefinite case.
fn solve_symmetric(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    if let Some(chol) = a.clone().cholesky() {
        return Ok(chol.solve(b));
    }
    a.clone()
        .lu()
        .solve(b)
        .ok_or_else(|| MeasError::Range("singular spatial-fit normal equations".to_string()))
}

// Set `params` into the kernel and collect one residual per usable
// candidate: sqrt(chi2_i) with the amplitude profiled out in closed form.
fn chi2_residuals<P: Pixel>(
    kernel: &mut LinearCombinationKernel,
    params: &[f64],
    cells: &SpatialCellSet<P>,
    n_per_cell: i32,
) -> Result<(f64, DVector<f64>)> {
    kernel.set_spatial_parameters(params)?;
    let mut residuals = Vec::new();
    let mut total = 0.0;
    let mut failure: Option<MeasError> = None;
    cells.visit_candidates(n_per_cell, |cand| {
        if failure.is_some() {
            return;
        }
        let Ok(data) = cand.image() else {
            return;
        };
        let kimage = kernel.compute_image(cand.x_center(), cand.y_center());
        match fit_kernel_image(&kimage, &data) {
            Ok((chi2, amp)) => {
                cand.set_chi2(chi2);
                cand.set_amplitude(amp);
                total += chi2;
                residuals.push(chi2.max(0.0).sqrt());
            }
            Err(e) => failure = Some(e.at_position(cand.x_center(), cand.y_center())),
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok((total, DVector::from_vec(residuals))),
    }
}

/// Nonlinear fit of the kernel's spatial coefficients: damped least
/// squares over the profiled chi2, with a finite-difference Jacobian and
/// the overall normalization (component 0's constant term) held fixed.
///
/// Returns (converged, chi2). The best parameters seen are adopted even
/// when the minimizer did not converge within its iteration limit.
pub fn fit_spatial_kernel_from_psf_candidates<P: Pixel>(
    kernel: &mut LinearCombinationKernel,
    cells: &SpatialCellSet<P>,
    n_star_per_cell: i32,
    tolerance: f64,
) -> Result<(bool, f64)> {
    const MAX_ITERATIONS: usize = 100;
    const LAMBDA_FACTOR: f64 = 10.0;
    const LAMBDA_LIMIT: f64 = 1e10;

    let nc = kernel.n_basis();
    let ns = kernel.n_spatial_parameters();
    let nt = nc * ns;

    let mut params = vec![0.0; nt];
    for c in 0..nc {
        params[c * ns] = 1.0; // the constant part of each component
    }
    let free: Vec<usize> = (1..nt).collect(); // parameter (0, 0) stays fixed

    let (mut current, mut residuals) = chi2_residuals(kernel, &params, cells, n_star_per_cell)?;
    let mut best = params.clone();
    let mut best_chi2 = current;
    let mut converged = false;

    if free.is_empty() || residuals.is_empty() {
        kernel.set_spatial_parameters(&params)?;
        evaluate_candidates(kernel, cells, 0)?;
        return Ok((true, current));
    }

    let mut lambda = 1e-3;
    for _iter in 0..MAX_ITERATIONS {
        let m = residuals.len();
        let mut jacobian = DMatrix::<f64>::zeros(m, free.len());
        for (col, &pi) in free.iter().enumerate() {
            let step = 1e-4 * params[pi].abs().max(1.0);
            let mut stepped = params.clone();
            stepped[pi] += step;
            let (_, stepped_res) = chi2_residuals(kernel, &stepped, cells, n_star_per_cell)?;
            for row in 0..m {
                jacobian[(row, col)] = (stepped_res[row] - residuals[row]) / step;
            }
        }
        let jt = jacobian.transpose();
        let jtj = &jt * &jacobian;
        let jtr = &jt * &residuals;

        let mut improved = false;
        loop {
            // Damped Gauss-Newton step.
            let mut h = jtj.clone();
            for d in 0..free.len() {
                h[(d, d)] += lambda;
            }
            match h.lu().solve(&jtr) {
                Some(delta) => {
                    let mut trial = params.clone();
                    for (col, &pi) in free.iter().enumerate() {
                        trial[pi] -= delta[col];
                    }
                    let (trial_chi2, trial_res) =
                        chi2_residuals(kernel, &trial, cells, n_star_per_cell)?;
                    if trial_chi2 < current {
                        let gain = current - trial_chi2;
                        params = trial;
                        current = trial_chi2;
                        residuals = trial_res;
                        lambda /= LAMBDA_FACTOR;
                        improved = true;
                        if current < best_chi2 {
                            best_chi2 = current;
                            best = params.clone();
                        }
                        if gain < tolerance {
                            converged = true;
                        }
                        break;
                    }
                    lambda *= LAMBDA_FACTOR;
                    if lambda > LAMBDA_LIMIT {
                        break;
                    }
                }
                None => {
                    lambda *= LAMBDA_FACTOR;
                    if lambda > LAMBDA_LIMIT {
                        break;
                    }
                }
            }
        }
        if !improved {
            // No direction lowers chi2 any further; treat the current
            // point as the minimum.
            converged = true;
            break;
        }
        if converged {
            break;
        }
    }

    // Adopt the best point regardless of convergence.
    kernel.set_spatial_parameters(&best)?;
    evaluate_candidates(kernel, cells, 0)?;
    debug!(
        "nonlinear spatial fit: chi2 {:.4e}, converged: {}",
        best_chi2, converged
    );
    Ok((converged && best_chi2.is_finite(), best_chi2))
}

/// Evaluate the PSF at (x, y), fit its amplitude to the underlying data,
/// and subtract the scaled realisation in place. Returns the chi2 of the
/// amplitude fit.
pub fn subtract_psf<P: Pixel>(
    psf: &dyn Psf,
    data: &mut MaskedImage<P>,
    x: f64,
    y: f64,
) -> Result<f64> {
    let kimage = psf.image(x, y);
    let left = kimage.x0() - data.x0();
    let top = kimage.y0() - data.y0();
    let sub = data
        .subimage(left, top, kimage.width(), kimage.height())
        .map_err(|e| e.at_position(x, y))?;

    let (chi2, amp) = fit_kernel_image(&kimage, &sub).map_err(|e| e.at_position(x, y))?;

    for yy in 0..kimage.height() as i32 {
        for xx in 0..kimage.width() as i32 {
            let v = data.image().get(left + xx, top + yy).to_f64() - amp * kimage.get(xx, yy);
            data.image_mut().set(left + xx, top + yy, P::from_f64(v));
        }
    }
    Ok(chi2)
}

/// Fit a linear-combination kernel to the data around `pos`, letting every
/// basis component's weight float independently.
///
/// Each basis image is recentered by the fractional part of the position;
/// the returned kernel is spatially constant with the solved weights.
pub fn fit_kernel_to_image<P: Pixel>(
    kernel: &LinearCombinationKernel,
    data: &MaskedImage<P>,
    pos: (f64, f64),
) -> Result<(LinearCombinationKernel, f64)> {
    let n = kernel.n_basis();
    let (cx, cy) = kernel.ctr();

    let mut shifted: Vec<Image<f64>> = Vec::with_capacity(n);
    for basis in kernel.basis_images() {
        let mut img = basis.clone();
        img.set_xy0(0, 0);
        shifted.push(offset_image(&img, pos.0 - cx as f64, pos.1 - cy as f64));
    }

    let left = shifted[0].x0() - data.x0();
    let top = shifted[0].y0() - data.y0();
    let sub = data
        .subimage(left, top, kernel.width(), kernel.height())
        .map_err(|e| e.at_position(pos.0, pos.1))?;

    let mut a = DMatrix::<f64>::zeros(n, n);
    let mut b = DVector::<f64>::zeros(n);
    for i in 0..n {
        b[i] = inner_product(&shifted[i], sub.image(), 0)?;
        for j in i..n {
            let dot = inner_product(&shifted[i], &shifted[j], 0)?;
            a[(i, j)] = dot;
            a[(j, i)] = dot;
        }
    }
    let x = solve_symmetric(&a, &b)?;

    let out = LinearCombinationKernel::new_fixed(shifted, x.as_slice())?;
    Ok((out, 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::double_gaussian::DoubleGaussianPsf;
    use crate::spatial_cell::PsfCandidate;
    use imageproc::rect::Rect;
    use std::rc::Rc;

    // A parent image with identical Gaussian stars at the given positions.
    fn starfield(size: usize, positions: &[(f64, f64)], sigma: f64, peak: f64) -> MaskedImage<f32> {
        let mut mi = MaskedImage::new(size, size);
        mi.variance_mut().fill(1.0);
        for &(sx, sy) in positions {
            for y in 0..size as i32 {
                for x in 0..size as i32 {
                    let r2 = (x as f64 - sx).powi(2) + (y as f64 - sy).powi(2);
                    let v = mi.image().get(x, y) as f64 + peak * (-r2 / (2.0 * sigma * sigma)).exp();
                    mi.image_mut().set(x, y, v as f32);
                }
            }
        }
        mi
    }

    fn grid_cells(
        size: usize,
        positions: &[(f64, f64)],
        sigma: f64,
        peak: f64,
    ) -> SpatialCellSet<f32> {
        let parent = Rc::new(starfield(size, positions, sigma, peak));
        let flux = peak * 2.0 * std::f64::consts::PI * sigma * sigma;
        let region = Rect::at(0, 0).of_size(size as u32, size as u32);
        let mut cells = SpatialCellSet::new(region, 20, 20).unwrap();
        for &(sx, sy) in positions {
            cells
                .insert_candidate(PsfCandidate::new(Rc::clone(&parent), sx, sy, flux))
                .unwrap();
        }
        cells
    }

    fn grid_positions() -> Vec<(f64, f64)> {
        let mut out = Vec::new();
        for &y in &[10.0, 30.0, 50.0] {
            for &x in &[10.0, 30.0, 50.0] {
                out.push((x, y));
            }
        }
        out
    }

    #[test]
    fn test_create_kernel_from_identical_stars() {
        // Scenario S6: identical stars on a 3x3 grid, one component,
        // constant spatial order.
        let positions = grid_positions();
        let mut cells = grid_cells(60, &positions, 2.0, 1000.0);
        let (kernel, eigen_values) =
            create_kernel_from_psf_candidates(&mut cells, 1, 0, 15, 1, false).unwrap();
        assert_eq!(kernel.n_basis(), 1);
        assert_eq!(kernel.n_spatial_parameters(), 1);
        assert_eq!(kernel.spatial_parameters()[0][0], 1.0);
        assert_eq!(eigen_values.len(), positions.len());
        assert!(eigen_values[0] > 0.0);

        // The eigen-image is the common stamp up to sign and scale:
        // normalized correlation close to +-1.
        let mut reference = Image::<f64>::new(15, 15);
        for y in 0..15i32 {
            for x in 0..15i32 {
                let r2 = ((x - 7) * (x - 7) + (y - 7) * (y - 7)) as f64;
                reference.set(x, y, 1000.0 * (-r2 / 8.0).exp());
            }
        }
        let eigen = &kernel.basis_images()[0];
        let dot = inner_product(eigen, &reference, 0).unwrap();
        let nref = inner_product(&reference, &reference, 0).unwrap().sqrt();
        let neig = inner_product(eigen, eigen, 0).unwrap().sqrt();
        let corr = dot / (nref * neig);
        assert!(corr.abs() > 0.995, "correlation {}", corr);
    }

    #[test]
    fn test_linear_fit_identical_stars_gives_unit_coefficient() {
        let positions = grid_positions();
        let mut cells = grid_cells(60, &positions, 2.0, 1000.0);
        let (mut kernel, _) =
            create_kernel_from_psf_candidates(&mut cells, 1, 0, 15, 1, false).unwrap();
        let (ok, chi2) = fit_spatial_kernel(&mut kernel, &cells, false, 1, 1e-6).unwrap();
        assert!(ok);
        let coeff = kernel.spatial_parameters()[0][0];
        assert!((coeff - 1.0).abs() < 1e-6, "coefficient {}", coeff);

        // Invariant: re-evaluating the fitted kernel reproduces the
        // returned chi2.
        let recomputed = evaluate_candidates(&kernel, &cells, 0).unwrap();
        assert!(
            (chi2 - recomputed).abs() <= 1e-6 * chi2.abs().max(1.0),
            "chi2 {} vs recomputed {}",
            chi2,
            recomputed
        );
    }

    #[test]
    fn test_normal_equations_are_symmetric() {
        let positions = grid_positions();
        let mut cells = grid_cells(60, &positions, 2.0, 1000.0);
        let (kernel, _) =
            create_kernel_from_psf_candidates(&mut cells, 2, 1, 15, 1, false).unwrap();
        evaluate_candidates(&kernel, &cells, 1).unwrap();
        let (a, _) = assemble_normal_equations(&kernel, &cells, 1, 0.0).unwrap();
        for i in 0..a.nrows() {
            for j in 0..a.ncols() {
                assert_eq!(a[(i, j)], a[(j, i)], "A[{},{}] != A[{},{}]", i, j, j, i);
            }
        }
    }

    #[test]
    fn test_nonlinear_fit_identical_stars() {
        let positions = grid_positions();
        let mut cells = grid_cells(60, &positions, 2.0, 1000.0);
        let (mut kernel, _) =
            create_kernel_from_psf_candidates(&mut cells, 1, 1, 15, 1, false).unwrap();
        let (ok, chi2) =
            fit_spatial_kernel_from_psf_candidates(&mut kernel, &cells, 1, 1e-9).unwrap();
        assert!(ok);
        assert!(chi2.is_finite());
        // With identical stars, the spatially varying terms stay near zero.
        let params = kernel.spatial_parameters();
        assert!(params[0][1].abs() < 1e-3, "x term {}", params[0][1]);
        assert!(params[0][2].abs() < 1e-3, "y term {}", params[0][2]);
    }

    #[test]
    fn test_fit_modes_agree_on_identical_stars() {
        let positions = grid_positions();
        let mut cells = grid_cells(60, &positions, 2.0, 1000.0);
        let (mut linear_kernel, _) =
            create_kernel_from_psf_candidates(&mut cells, 1, 0, 15, 1, false).unwrap();
        let (_, linear_chi2) =
            fit_spatial_kernel(&mut linear_kernel, &cells, false, 1, 1e-9).unwrap();
        let (mut nl_kernel, _) =
            create_kernel_from_psf_candidates(&mut cells, 1, 0, 15, 1, false).unwrap();
        let (_, nl_chi2) = fit_spatial_kernel(&mut nl_kernel, &cells, true, 1, 1e-9).unwrap();
        let scale = linear_chi2.abs().max(1.0);
        assert!(
            (linear_chi2 - nl_chi2).abs() / scale < 0.05,
            "linear {} vs nonlinear {}",
            linear_chi2,
            nl_chi2
        );
    }

    #[test]
    fn test_count_psf_candidates_skips_edge_stars() {
        // One star too close to the edge for a 15x15 stamp.
        let positions = vec![(30.0, 30.0), (3.0, 30.0)];
        let mut cells = grid_cells(60, &positions, 2.0, 1000.0);
        cells.visit_candidates_mut(0, |c| c.set_stamp_size(15, 15));
        assert_eq!(count_psf_candidates(&cells, 0), 1);
    }

    #[test]
    fn test_subtract_psf_removes_star() {
        let mut mi = starfield(31, &[(15.0, 15.0)], 2.0, 500.0);
        let psf = DoubleGaussianPsf::new(15, 15, 2.0, 0.0, 0.0).unwrap();
        let chi2 = subtract_psf(&psf, &mut mi, 15.0, 15.0).unwrap();
        assert!(chi2.is_finite());
        let peak = mi.image().get(15, 15);
        assert!(peak.abs() < 1.0, "residual peak {}", peak);
    }

    #[test]
    fn test_subtract_fitted_kernel_psf() {
        // End to end: build the spatial model from the starfield, wrap it
        // as a PSF, and subtract one of the stars it was built from.
        use crate::psf::KernelPsf;
        let positions = grid_positions();
        let mut cells = grid_cells(60, &positions, 2.0, 1000.0);
        let (mut kernel, _) =
            create_kernel_from_psf_candidates(&mut cells, 1, 0, 15, 1, false).unwrap();
        fit_spatial_kernel(&mut kernel, &cells, false, 1, 1e-9).unwrap();
        let psf = KernelPsf::new(kernel);

        let mut mi = starfield(60, &positions, 2.0, 1000.0);
        let chi2 = subtract_psf(&psf, &mut mi, 30.0, 30.0).unwrap();
        assert!(chi2.is_finite());
        let residual = mi.image().get(30, 30);
        assert!(residual.abs() < 100.0, "residual peak {}", residual);
    }

    #[test]
    fn test_subtract_psf_off_image_is_out_of_bounds() {
        let mut mi = starfield(31, &[(15.0, 15.0)], 2.0, 500.0);
        let psf = DoubleGaussianPsf::new(15, 15, 2.0, 0.0, 0.0).unwrap();
        assert!(matches!(
            subtract_psf(&psf, &mut mi, 2.0, 15.0),
            Err(MeasError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_fit_kernel_to_image_recovers_scale() {
        // Data is 3x the kernel's single basis image.
        let mut basis = Image::<f64>::new(15, 15);
        for y in 0..15i32 {
            for x in 0..15i32 {
                let r2 = ((x - 7) * (x - 7) + (y - 7) * (y - 7)) as f64;
                basis.set(x, y, (-r2 / 8.0).exp());
            }
        }
        let kernel = LinearCombinationKernel::new_fixed(vec![basis.clone()], &[1.0]).unwrap();

        let mut mi = MaskedImage::<f32>::new(31, 31);
        mi.variance_mut().fill(1.0);
        for y in 0..15i32 {
            for x in 0..15i32 {
                mi.image_mut().set(x + 8, y + 8, (3.0 * basis.get(x, y)) as f32);
            }
        }
        let (fitted, chi2) = fit_kernel_to_image(&kernel, &mi, (15.0, 15.0)).unwrap();
        assert_eq!(chi2, 0.0);
        let weight = fitted.spatial_parameters()[0][0];
        assert!((weight - 3.0).abs() < 1e-3, "weight {}", weight);
    }

    #[test]
    fn test_zero_model_norm_is_range_error() {
        let model = Image::<f64>::new(15, 15); // all zeros
        let mut data = MaskedImage::<f32>::new(15, 15);
        data.variance_mut().fill(1.0);
        assert!(matches!(
            fit_kernel_image(&model, &data),
            Err(MeasError::Range(_))
        ));
    }

    #[test]
    fn test_zero_variance_pixels_are_skipped() {
        let mut model = Image::<f64>::new(5, 5);
        model.fill(1.0);
        let mut data = MaskedImage::<f64>::new(5, 5);
        data.image_mut().fill(2.0);
        data.variance_mut().fill(1.0);
        // Poison one pixel; zero variance must exclude it from the sums.
        data.image_mut().set(2, 2, 1e12);
        data.variance_mut().set(2, 2, 0.0);
        let (chi2, amp) = fit_kernel_image(&model, &data).unwrap();
        assert!((amp - 2.0).abs() < 1e-12);
        assert!(chi2.abs() < 1e-9);
    }
}
