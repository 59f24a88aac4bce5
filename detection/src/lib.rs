//! Per-camera motion detection core.
//!
//! This crate holds everything that happens between "a YUV420p frame
//! arrived" and "an event action must be carried out": the reference-frame
//! model, the pixel-difference and despeckle kernels (scalar and SSE2), the
//! learned smartmask, the lightswitch heuristic, and the motion-event state
//! machine with its pre-capture ring.
//!
//! The crate performs no I/O other than mask PGM files. Capture devices,
//! movie/picture writers and database sinks live in the camera hub, which
//! drives [`model::DetectionModel`] and [`event::EventMachine`] once per
//! captured frame and executes the [`event::EventAction`]s they emit.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

pub mod event;
pub mod frame;
pub mod mask;
pub mod model;
pub mod pixel;

use thiserror::Error;

/// Errors surfaced by the detection core.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("frame dimensions {0}x{1} are not multiples of 8")]
    BadDimensions(usize, usize),
    #[error("plane buffer has {got} bytes, expected {expected}")]
    BadPlaneSize { got: usize, expected: usize },
    #[error("not a binary PGM (P5) file")]
    NotPgm,
    #[error("malformed PGM header: {0}")]
    PgmHeader(String),
    #[error("PGM maxval {0} out of range (1..=255)")]
    PgmMaxval(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
