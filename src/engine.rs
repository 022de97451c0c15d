//! Tweak engine: staged WCS refinement as an explicit state machine.
//!
//! The engine owns one [`TanWcs`] + [`SipDistortion`] pair seeded from the
//! caller's initial solution and refines them in strict forward order:
//!
//! ```text
//! Initial → LinearCd → SipForward → SipInverse → Done
//! ```
//!
//! - **LinearCd** refits the CD matrix (and, unless `skip_shift`, the
//!   reference sky position) by weighted least squares in tangent-plane
//!   coordinates, iterating the CRVAL update to convergence.
//! - **SipForward** fits the forward A/B polynomials against the residual
//!   corrected-pixel offsets. The fitted constant term is folded into CRVAL
//!   and the fitted linear term into CD, so the stored grids carry only
//!   degree ≥ 2 terms.
//! - **SipInverse** refits the inverse AP/BP polynomials from a regular grid
//!   sample of the fitted forward map.
//!
//! [`TweakEngine::advance_to`] drives the engine through every intermediate
//! state up to the target; re-requesting a reached state is a no-op, and a
//! failing stage leaves the model exactly as the previous stage left it.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::correspond::Correspondences;
use crate::error::{TweakError, TweakResult};
use crate::fitter::solve_pair;
use crate::sip::{basis_matrix, fit_scale, sip_sky_to_pixel, term_pairs, SipDistortion};
use crate::tanwcs::{cd_inverse, inverse_tan_project, tan_project, TanWcs};

/// Maximum inner iterations for the CRVAL/CD convergence loop.
const MAX_LINEAR_ITERS: u32 = 10;

/// Tangent-plane offset below which the linear stage is converged (radians).
const SHIFT_CONVERGENCE_RAD: f64 = 1e-12;

/// Progress marker for the refinement run. States only advance; going back
/// requires [`TweakEngine::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FitState {
    /// Seeded, nothing fit yet.
    Initial,
    /// Linear CD matrix (and CRVAL) refit.
    LinearCd,
    /// Forward A/B distortion polynomials fit.
    SipForward,
    /// Inverse AP/BP distortion polynomials fit.
    SipInverse,
    /// Terminal; no further mutation.
    Done,
}

impl FitState {
    fn next(self) -> Option<FitState> {
        match self {
            FitState::Initial => Some(FitState::LinearCd),
            FitState::LinearCd => Some(FitState::SipForward),
            FitState::SipForward => Some(FitState::SipInverse),
            FitState::SipInverse => Some(FitState::Done),
            FitState::Done => None,
        }
    }
}

impl fmt::Display for FitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FitState::Initial => "initial",
            FitState::LinearCd => "linear-cd",
            FitState::SipForward => "sip-forward",
            FitState::SipInverse => "sip-inverse",
            FitState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Engine configuration, fixed for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct TweakConfig {
    /// Use the per-correspondence weights. When disabled every weight is
    /// treated as 1.0, zero weights included.
    pub weighted_fit: bool,
    /// Hold CRPIX and CRVAL fixed at their seeded values and refit only the
    /// 2×2 CD matrix (plus distortion). Use when the seed's reference point
    /// is already trusted and translation noise would destabilize the fit.
    pub skip_shift: bool,
    /// Target order of the forward A/B polynomials. 0 or 1 degenerates to a
    /// pure linear fit with all distortion coefficients zero.
    pub forward_order: u32,
    /// Target order of the inverse AP/BP polynomials. 0 leaves the inverse
    /// grids zero.
    pub inverse_order: u32,
}

impl Default for TweakConfig {
    fn default() -> Self {
        Self {
            weighted_fit: false,
            skip_shift: false,
            forward_order: 2,
            inverse_order: 4,
        }
    }
}

/// A single usable observation for a fit stage.
struct FitPoint {
    u: f64,
    v: f64,
    ra: f64,
    dec: f64,
    w: f64,
}

/// Iterative WCS refinement engine.
///
/// Seeded with a copy of the caller's [`TanWcs`]; the caller's original is
/// never mutated. The correspondence set is read-only for the engine's
/// lifetime. Intermediate results may be inspected after any partial
/// [`advance_to`](Self::advance_to).
#[derive(Debug)]
pub struct TweakEngine<'a> {
    config: TweakConfig,
    corr: Correspondences<'a>,
    seed: TanWcs,
    tan: TanWcs,
    sip: SipDistortion,
    state: FitState,
}

impl<'a> TweakEngine<'a> {
    /// Create an engine from an initial tangent-plane model, correspondences,
    /// and configuration.
    ///
    /// Fails with [`TweakError::Configuration`] for an empty correspondence
    /// set or a polynomial order above [`MAX_ORDER`](crate::sip::MAX_ORDER).
    pub fn new(
        initial: &TanWcs,
        corr: Correspondences<'a>,
        config: TweakConfig,
    ) -> TweakResult<Self> {
        if corr.is_empty() {
            return Err(TweakError::configuration(
                "cannot fit with zero correspondences",
            ));
        }
        let sip = SipDistortion::zero(config.forward_order, config.inverse_order)?;
        Ok(Self {
            config,
            corr,
            seed: initial.clone(),
            tan: initial.clone(),
            sip,
            state: FitState::Initial,
        })
    }

    /// Current progress state.
    pub fn state(&self) -> FitState {
        self.state
    }

    /// Current tangent-plane model.
    pub fn tan(&self) -> &TanWcs {
        &self.tan
    }

    /// Current distortion model.
    pub fn distortion(&self) -> &SipDistortion {
        &self.sip
    }

    /// Consume the engine, returning the fitted model pair.
    pub fn into_model(self) -> (TanWcs, SipDistortion) {
        (self.tan, self.sip)
    }

    /// Discard all fit results and return to the seeded state.
    pub fn reset(&mut self) {
        self.tan = self.seed.clone();
        // orders were validated at construction
        self.sip = SipDistortion::zero(self.config.forward_order, self.config.inverse_order)
            .expect("orders validated at construction");
        self.state = FitState::Initial;
    }

    /// Advance through every stage up to and including `target`.
    ///
    /// Idempotent past the requested state: a target at or below the current
    /// state is a no-op, never a rollback. On error the engine keeps the
    /// results of every stage completed before the failure.
    pub fn advance_to(&mut self, target: FitState) -> TweakResult<()> {
        while self.state < target {
            let next = self
                .state
                .next()
                .expect("non-terminal state always has a successor");
            match next {
                FitState::LinearCd => {
                    let tan = self.fit_linear()?;
                    self.tan = tan;
                }
                FitState::SipForward => {
                    let (tan, sip) = self.fit_sip_forward()?;
                    self.tan = tan;
                    self.sip = sip;
                }
                FitState::SipInverse => {
                    let mut sip = self.sip.clone();
                    sip.fit_inverse(&self.tan, self.config.inverse_order)?;
                    self.sip = sip;
                }
                FitState::Done | FitState::Initial => {}
            }
            self.state = next;
            debug!(
                "tweak: reached {} (rms residual {:.3e} px)",
                self.state,
                self.rms_residual_px()
            );
        }
        Ok(())
    }

    /// Weighted RMS of predicted-minus-observed pixel positions under the
    /// current model.
    pub fn rms_residual_px(&self) -> f64 {
        let mut sum = 0.0;
        let mut wsum = 0.0;
        for ((x, y), (ra, dec), w) in self.corr.iter() {
            let w = if self.config.weighted_fit { w } else { 1.0 };
            if w == 0.0 {
                continue;
            }
            if let Some((px, py)) = sip_sky_to_pixel(&self.tan, &self.sip, ra, dec) {
                let dx = x - px;
                let dy = y - py;
                sum += w * (dx * dx + dy * dy);
                wsum += w;
            }
        }
        if wsum == 0.0 {
            0.0
        } else {
            (sum / wsum).sqrt()
        }
    }

    // ── Stage implementations ───────────────────────────────────────────────
    //
    // Each stage computes into temporaries and commits in `advance_to` only
    // on success, so a failed stage cannot leave partial results behind.

    /// Usable observations as CRPIX-relative offsets. Zero-weight pairs are
    /// dropped entirely when weighted fitting is on; otherwise every pair
    /// participates with weight 1.0.
    fn usable_points(&self) -> Vec<FitPoint> {
        self.corr
            .iter()
            .filter_map(|((x, y), (ra, dec), w)| {
                let w = if self.config.weighted_fit { w } else { 1.0 };
                if w == 0.0 {
                    return None;
                }
                Some(FitPoint {
                    u: x - self.tan.crpix[0],
                    v: y - self.tan.crpix[1],
                    ra,
                    dec,
                    w,
                })
            })
            .collect()
    }

    /// LinearCd: weighted LS fit of CD (and CRVAL) in tangent-plane
    /// coordinates, distortion held fixed at zero, iterated until the fitted
    /// tangent-plane shift vanishes.
    fn fit_linear(&self) -> TweakResult<TanWcs> {
        let stage = FitState::LinearCd;
        let pts = self.usable_points();
        let ncols = if self.config.skip_shift { 2 } else { 3 };
        let mut tan = self.tan.clone();

        for iter in 0..MAX_LINEAR_ITERS {
            let mut uv = Vec::with_capacity(pts.len());
            let mut txi = Vec::with_capacity(pts.len());
            let mut teta = Vec::with_capacity(pts.len());
            let mut ws = Vec::with_capacity(pts.len());
            for p in &pts {
                let Some((xi, eta)) = tan_project(p.ra, p.dec, tan.crval[0], tan.crval[1])
                else {
                    continue;
                };
                uv.push((p.u, p.v));
                txi.push(xi);
                teta.push(eta);
                ws.push(p.w);
            }

            let n = uv.len();
            if n < ncols {
                return Err(TweakError::underdetermined(stage, n, ncols));
            }

            let mut design = DMatrix::zeros(n, ncols);
            for (i, &(u, v)) in uv.iter().enumerate() {
                design[(i, 0)] = u;
                design[(i, 1)] = v;
                if ncols == 3 {
                    design[(i, 2)] = 1.0;
                }
            }
            let bx = DVector::from_vec(txi);
            let by = DVector::from_vec(teta);
            let weights = self.config.weighted_fit.then_some(ws.as_slice());

            let (sx, sy) = solve_pair(&design, &bx, &by, weights)
                .map_err(|e| TweakError::numerical(stage, n, e))?;

            tan.cd = [[sx[0], sx[1]], [sy[0], sy[1]]];

            if self.config.skip_shift {
                break;
            }
            let dxi = sx[2];
            let deta = sy[2];
            let (ra, dec) = inverse_tan_project(dxi, deta, tan.crval[0], tan.crval[1]);
            tan.crval = [ra, dec];
            debug!(
                "  linear-cd iter {iter}: offset=({dxi:.3e}, {deta:.3e}) rad, {n} points"
            );
            if dxi.abs() + deta.abs() < SHIFT_CONVERGENCE_RAD {
                break;
            }
        }

        Ok(tan)
    }

    /// SipForward: fit the forward polynomial grids against the residual
    /// corrected-pixel offsets, folding the fitted constant into CRVAL and
    /// the fitted linear term into CD.
    fn fit_sip_forward(&self) -> TweakResult<(TanWcs, SipDistortion)> {
        let stage = FitState::SipForward;
        let order = self.config.forward_order;
        let mut tan = self.tan.clone();
        let mut sip = self.sip.clone();
        sip.forward_order = order;
        sip.a = [[0.0; crate::sip::GRID]; crate::sip::GRID];
        sip.b = [[0.0; crate::sip::GRID]; crate::sip::GRID];

        if order < 2 {
            // the linear stage already is the degenerate affine fit
            return Ok((tan, sip));
        }

        let pairs: Vec<(u32, u32)> = term_pairs(order)
            .into_iter()
            .filter(|&(p, q)| !(self.config.skip_shift && p == 0 && q == 0))
            .collect();
        let required = pairs.len();

        let pts = self.usable_points();
        let cd_inv = cd_inverse(&tan.cd)
            .ok_or_else(|| TweakError::numerical(stage, pts.len(), "CD matrix is singular"))?;

        // design built on scaled offsets, coefficients rescaled after the solve
        let scale = fit_scale(&tan);
        let mut uv = Vec::with_capacity(pts.len());
        let mut tx = Vec::with_capacity(pts.len());
        let mut ty = Vec::with_capacity(pts.len());
        let mut ws = Vec::with_capacity(pts.len());
        for p in &pts {
            let Some((xi, eta)) = tan_project(p.ra, p.dec, tan.crval[0], tan.crval[1]) else {
                continue;
            };
            let bigu = cd_inv[0][0] * xi + cd_inv[0][1] * eta;
            let bigv = cd_inv[1][0] * xi + cd_inv[1][1] * eta;
            uv.push((p.u / scale, p.v / scale));
            tx.push(bigu - p.u);
            ty.push(bigv - p.v);
            ws.push(p.w);
        }

        let n = uv.len();
        if n < required {
            return Err(TweakError::underdetermined(stage, n, required));
        }

        let design = basis_matrix(&pairs, &uv);
        let bx = DVector::from_vec(tx);
        let by = DVector::from_vec(ty);
        let weights = self.config.weighted_fit.then_some(ws.as_slice());
        let (ca, cb) = solve_pair(&design, &bx, &by, weights)
            .map_err(|e| TweakError::numerical(stage, n, e))?;

        // Split the solution: degree ≥ 2 terms go to the grids, the constant
        // and linear terms are folded into CRVAL and CD so the grids stay in
        // canonical SIP form.
        let mut shift = [0.0f64; 2];
        let mut lin = [[0.0f64; 2]; 2];
        for (idx, &(p, q)) in pairs.iter().enumerate() {
            let s = scale.powi((p + q) as i32);
            let va = ca[idx] / s;
            let vb = cb[idx] / s;
            match (p, q) {
                (0, 0) => shift = [va, vb],
                (1, 0) => {
                    lin[0][0] = va;
                    lin[1][0] = vb;
                }
                (0, 1) => {
                    lin[0][1] = va;
                    lin[1][1] = vb;
                }
                _ => {
                    sip.a[p as usize][q as usize] = va;
                    sip.b[p as usize][q as usize] = vb;
                }
            }
        }

        // U = (I + L)·u + shift + high-order, so CD ← CD·(I + L) and the
        // tangent-plane offset of the constant is CD·shift (pre-update CD).
        let cd = tan.cd;
        if !self.config.skip_shift {
            let dxi = cd[0][0] * shift[0] + cd[0][1] * shift[1];
            let deta = cd[1][0] * shift[0] + cd[1][1] * shift[1];
            let (ra, dec) = inverse_tan_project(dxi, deta, tan.crval[0], tan.crval[1]);
            tan.crval = [ra, dec];
        }
        tan.cd = [
            [
                cd[0][0] * (1.0 + lin[0][0]) + cd[0][1] * lin[1][0],
                cd[0][0] * lin[0][1] + cd[0][1] * (1.0 + lin[1][1]),
            ],
            [
                cd[1][0] * (1.0 + lin[0][0]) + cd[1][1] * lin[1][0],
                cd[1][0] * lin[0][1] + cd[1][1] * (1.0 + lin[1][1]),
            ],
        ];

        Ok((tan, sip))
    }
}
