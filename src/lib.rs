//! # siptweak
//!
//! An iterative **tangent-plane WCS refinement engine** ("tweak") in Rust.
//!
//! Given an initial TAN astrometric solution and a set of matched
//! (image pixel, reference sky) correspondences, the engine jointly refines
//! the linear tangent-plane projection and a SIP-style polynomial optical
//! distortion model by weighted linear least squares, advancing through an
//! explicit state machine:
//!
//! ```text
//! Initial → LinearCd → SipForward → SipInverse → Done
//! ```
//!
//! The engine does not detect stars, match catalogs, or touch any I/O —
//! correspondences arrive already matched and the fitted models go back to
//! the caller.
//!
//! ## Example
//!
//! ```no_run
//! use siptweak::{Correspondences, FitState, TanWcs, TweakConfig, TweakEngine};
//!
//! let initial = TanWcs {
//!     crval: [150.0_f64.to_radians(), -30.0_f64.to_radians()],
//!     crpix: [1000.5, 1000.5],
//!     cd: [
//!         [(1.0_f64 / 1000.0).to_radians(), 0.0],
//!         [0.0, (1.0_f64 / 1000.0).to_radians()],
//!     ],
//!     width: 2000.0,
//!     height: 2000.0,
//! };
//!
//! // Matched star positions: observed pixels and catalog (ra, dec) radians.
//! let image_xy: Vec<(f64, f64)> = vec![/* ... */];
//! let ref_radec: Vec<(f64, f64)> = vec![/* ... */];
//!
//! let corr = Correspondences::positional(&image_xy, &ref_radec)?;
//! let config = TweakConfig {
//!     weighted_fit: true,
//!     forward_order: 2,
//!     inverse_order: 4,
//!     ..Default::default()
//! };
//!
//! let mut engine = TweakEngine::new(&initial, corr, config)?;
//! engine.advance_to(FitState::Done)?;
//!
//! let (tan, sip) = engine.into_model();
//! println!("CD = {:?}, A(2,0) = {:.3e}", tan.cd, sip.a(2, 0));
//! # Ok::<(), siptweak::TweakError>(())
//! ```
//!
//! ## Numeric policy
//!
//! All computation is double precision. Coefficients are recomputed from
//! scratch at every stage, never accumulated incrementally. Least-squares
//! solves go through a dense SVD with an explicit conditioning check; an
//! ill-conditioned or underdetermined stage fails loudly and leaves the model
//! in its pre-stage state.

pub mod correspond;
pub mod engine;
pub mod error;
mod fitter;
pub mod sip;
pub mod tanwcs;

pub use correspond::Correspondences;
pub use engine::{FitState, TweakConfig, TweakEngine};
pub use error::{TweakError, TweakResult};
pub use sip::{sip_pixel_to_sky, sip_sky_to_pixel, SipDistortion, MAX_ORDER};
pub use tanwcs::TanWcs;
