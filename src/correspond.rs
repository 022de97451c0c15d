//! Matched image ↔ reference correspondences.
//!
//! A [`Correspondences`] is a read-only view pairing observed image pixel
//! positions with reference sky positions. The coordinate arrays stay owned
//! by the caller and are only borrowed; the set itself owns just the
//! (image index, reference index, weight) records. All validation happens at
//! construction, so iteration during fitting cannot fail.

use crate::error::{TweakError, TweakResult};

/// Read-only set of (image pixel, reference sky, weight) correspondences.
///
/// Sky coordinates are `(ra, dec)` in radians. Weights are non-negative;
/// unweighted construction assigns 1.0 to every pair.
#[derive(Debug, Clone)]
pub struct Correspondences<'a> {
    image_xy: &'a [(f64, f64)],
    ref_radec: &'a [(f64, f64)],
    pairs: Vec<(usize, usize)>,
    weights: Vec<f64>,
}

impl<'a> Correspondences<'a> {
    /// Pair the i-th image point with the i-th reference point, all weights 1.0.
    pub fn positional(
        image_xy: &'a [(f64, f64)],
        ref_radec: &'a [(f64, f64)],
    ) -> TweakResult<Self> {
        if image_xy.len() != ref_radec.len() {
            return Err(TweakError::configuration(format!(
                "positional pairing needs equal sequence lengths, got {} image and {} reference points",
                image_xy.len(),
                ref_radec.len()
            )));
        }
        let pairs = (0..image_xy.len()).map(|i| (i, i)).collect::<Vec<_>>();
        let weights = vec![1.0; image_xy.len()];
        Self::build(image_xy, ref_radec, pairs, weights)
    }

    /// Positional pairing with explicit per-pair weights.
    pub fn positional_weighted(
        image_xy: &'a [(f64, f64)],
        ref_radec: &'a [(f64, f64)],
        weights: &[f64],
    ) -> TweakResult<Self> {
        let mut set = Self::positional(image_xy, ref_radec)?;
        if weights.len() != set.pairs.len() {
            return Err(TweakError::configuration(format!(
                "{} weights supplied for {} correspondences",
                weights.len(),
                set.pairs.len()
            )));
        }
        check_weights(weights)?;
        set.weights = weights.to_vec();
        Ok(set)
    }

    /// Explicit index pairs into the image and reference sequences, with
    /// optional weights (1.0 each when `None`).
    ///
    /// Duplicate indices are allowed; each pair contributes its own row to
    /// every fit.
    pub fn with_indices(
        image_xy: &'a [(f64, f64)],
        ref_radec: &'a [(f64, f64)],
        image_indices: &[usize],
        ref_indices: &[usize],
        weights: Option<&[f64]>,
    ) -> TweakResult<Self> {
        if image_indices.len() != ref_indices.len() {
            return Err(TweakError::configuration(format!(
                "index pair lists differ in length: {} image vs {} reference",
                image_indices.len(),
                ref_indices.len()
            )));
        }
        let weights = match weights {
            Some(w) => {
                if w.len() != image_indices.len() {
                    return Err(TweakError::configuration(format!(
                        "{} weights supplied for {} index pairs",
                        w.len(),
                        image_indices.len()
                    )));
                }
                check_weights(w)?;
                w.to_vec()
            }
            None => vec![1.0; image_indices.len()],
        };
        let pairs = image_indices
            .iter()
            .copied()
            .zip(ref_indices.iter().copied())
            .collect();
        Self::build(image_xy, ref_radec, pairs, weights)
    }

    fn build(
        image_xy: &'a [(f64, f64)],
        ref_radec: &'a [(f64, f64)],
        pairs: Vec<(usize, usize)>,
        weights: Vec<f64>,
    ) -> TweakResult<Self> {
        for &(im, re) in &pairs {
            if im >= image_xy.len() {
                return Err(TweakError::configuration(format!(
                    "image index {im} out of range for {} points",
                    image_xy.len()
                )));
            }
            if re >= ref_radec.len() {
                return Err(TweakError::configuration(format!(
                    "reference index {re} out of range for {} points",
                    ref_radec.len()
                )));
            }
        }
        Ok(Self {
            image_xy,
            ref_radec,
            pairs,
            weights,
        })
    }

    /// Number of correspondence pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate over `(image (x, y), reference (ra, dec), weight)` triples.
    pub fn iter(&self) -> impl Iterator<Item = ((f64, f64), (f64, f64), f64)> + '_ {
        self.pairs
            .iter()
            .zip(self.weights.iter())
            .map(|(&(im, re), &w)| (self.image_xy[im], self.ref_radec[re], w))
    }
}

fn check_weights(weights: &[f64]) -> TweakResult<()> {
    for (i, &w) in weights.iter().enumerate() {
        if !(w >= 0.0) || !w.is_finite() {
            return Err(TweakError::configuration(format!(
                "weight {w} at index {i} is not a finite non-negative number"
            )));
        }
    }
    Ok(())
}
