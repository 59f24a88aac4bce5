//! Portable per-pixel kernels. These are the reference implementations the
//! SSE2 path must agree with byte-for-byte; the vector code also calls in
//! here for tail pixels past the last full 16-byte row.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

pub(super) fn threshold_diff(reference: &[u8], virgin: &[u8], noise: u8, out: &mut [u8]) -> usize {
    let mut diffs = 0;
    for ((&r, &v), o) in reference.iter().zip(virgin.iter()).zip(out.iter_mut()) {
        if r.abs_diff(v) > noise {
            *o = 255;
            diffs += 1;
        } else {
            *o = 0;
        }
    }
    diffs
}

pub(super) fn update_reference(
    reference: &mut [u8],
    ref_age: &mut [u16],
    virgin: &[u8],
    smartmask: &[u8],
    out: &[u8],
    threshold_ref: u8,
    accept_timer: u16,
) {
    for i in 0..reference.len() {
        let thresholdmask = reference[i].abs_diff(virgin[i]) > threshold_ref;
        let includemask = thresholdmask && smartmask[i] != 0;

        if includemask {
            if ref_age[i] == 0 {
                // Always give new pixels a chance.
                ref_age[i] = 1;
            } else if ref_age[i] > accept_timer {
                // Include static object after some time.
                ref_age[i] = 0;
                reference[i] = virgin[i];
            } else if out[i] != 0 {
                // Motion pixel? Keep excluding from the reference.
                ref_age[i] = ref_age[i].saturating_add(1);
            } else {
                // Nothing special - release the pixel. The average rounds
                // up, matching the vector path's byte average.
                ref_age[i] = 0;
                reference[i] =
                    ((u16::from(reference[i]) + u16::from(virgin[i]) + 1) / 2) as u8;
            }
        } else {
            // No motion: copy to the reference frame.
            ref_age[i] = 0;
            reference[i] = virgin[i];
        }
    }
}
