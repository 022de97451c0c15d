//! Tangent-plane (TAN / gnomonic) WCS model.
//!
//! A `TanWcs` is the linear part of an astrometric solution: a reference sky
//! position (CRVAL), a reference pixel (CRPIX), and a 2×2 CD matrix mapping
//! pixel offsets from CRPIX to tangent-plane coordinates `(ξ, η)` in radians.
//! Image width/height ride along as metadata; the tweak engine carries them
//! through every fit stage untouched.
//!
//! All angles are in radians.

/// Tangent-plane astrometric model.
#[derive(Debug, Clone, PartialEq)]
pub struct TanWcs {
    /// Reference sky position `[RA, Dec]` in radians.
    pub crval: [f64; 2],
    /// Reference pixel `[x, y]`.
    pub crpix: [f64; 2],
    /// CD matrix: `[[CD11, CD12], [CD21, CD22]]` in radians per pixel.
    pub cd: [[f64; 2]; 2],
    /// Image width in pixels. Metadata only, never refit.
    pub width: f64,
    /// Image height in pixels. Metadata only, never refit.
    pub height: f64,
}

impl TanWcs {
    /// Pixel coordinates → sky coordinates `(ra, dec)` in radians.
    pub fn pixel_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let u = x - self.crpix[0];
        let v = y - self.crpix[1];
        let xi = self.cd[0][0] * u + self.cd[0][1] * v;
        let eta = self.cd[1][0] * u + self.cd[1][1] * v;
        inverse_tan_project(xi, eta, self.crval[0], self.crval[1])
    }

    /// Sky coordinates (radians) → pixel coordinates.
    ///
    /// Returns `None` if the sky position is on or behind the tangent plane,
    /// or if the CD matrix is singular.
    pub fn sky_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        let (xi, eta) = tan_project(ra, dec, self.crval[0], self.crval[1])?;
        let inv = cd_inverse(&self.cd)?;
        let u = inv[0][0] * xi + inv[0][1] * eta;
        let v = inv[1][0] * xi + inv[1][1] * eta;
        Some((u + self.crpix[0], v + self.crpix[1]))
    }

    /// Approximate pixel scale in radians per pixel, from `|det CD|`.
    pub fn pixel_scale(&self) -> f64 {
        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        det.abs().sqrt()
    }
}

/// Forward gnomonic (TAN) projection.
///
/// Projects celestial point `(ra, dec)` onto the tangent plane at
/// `(crval_ra, crval_dec)`. Returns `(ξ, η)` in radians, or `None` if the
/// point is on or behind the tangent plane.
///
/// Reference: Calabretta & Greisen (2002), FITS WCS Paper II, §5.1.1.
#[inline]
pub fn tan_project(ra: f64, dec: f64, crval_ra: f64, crval_dec: f64) -> Option<(f64, f64)> {
    let da = ra - crval_ra;
    let sin_dec = dec.sin();
    let cos_dec = dec.cos();
    let sin_dec0 = crval_dec.sin();
    let cos_dec0 = crval_dec.cos();
    let cos_da = da.cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }

    let xi = cos_dec * da.sin() / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some((xi, eta))
}

/// Inverse gnomonic (TAN) projection.
///
/// Given tangent-plane coordinates `(ξ, η)` in radians at reference point
/// `(crval_ra, crval_dec)`, returns celestial coordinates `(ra, dec)` in
/// radians.
#[inline]
pub fn inverse_tan_project(xi: f64, eta: f64, crval_ra: f64, crval_dec: f64) -> (f64, f64) {
    let sin_dec0 = crval_dec.sin();
    let cos_dec0 = crval_dec.cos();
    let rho_sq = xi * xi + eta * eta;

    if rho_sq < 1e-30 {
        return (crval_ra, crval_dec);
    }

    let rho = rho_sq.sqrt();
    let c = rho.atan(); // for TAN, c = atan(rho)
    let sin_c = c.sin();
    let cos_c = c.cos();

    let dec = (cos_c * sin_dec0 + eta * sin_c * cos_dec0 / rho).asin();
    let ra = crval_ra + (xi * sin_c).atan2(rho * cos_dec0 * cos_c - eta * sin_dec0 * sin_c);
    (ra, dec)
}

/// Invert a 2×2 matrix. Returns `None` if singular (|det| < 1e-30).
#[inline]
pub fn cd_inverse(cd: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if det.abs() < 1e-30 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [cd[1][1] * inv_det, -cd[0][1] * inv_det],
        [-cd[1][0] * inv_det, cd[0][0] * inv_det],
    ])
}
