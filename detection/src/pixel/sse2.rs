//! SSE2 implementations of the hot per-pixel kernels.
//!
//! The branchy scalar policy is recast as a series of byte-mask operations
//! so all pixels can be computed unconditionally in parallel; each mask
//! mirrors one arm of the scalar `if` cascade. SSE2 is part of the x86_64
//! baseline, so no runtime feature probe is needed.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

#![cfg(target_arch = "x86_64")]

use std::arch::x86_64::*;

/// Unsigned byte compare: 0xFF where `a > b`.
#[inline]
unsafe fn cmpgt_epu8(a: __m128i, b: __m128i) -> __m128i {
    let d = _mm_subs_epu8(a, b);
    _mm_xor_si128(_mm_cmpeq_epi8(d, _mm_setzero_si128()), _mm_set1_epi8(-1))
}

/// Unsigned 16-bit compare: 0xFFFF where `a > b`.
#[inline]
unsafe fn cmpgt_epu16(a: __m128i, b: __m128i) -> __m128i {
    let d = _mm_subs_epu16(a, b);
    _mm_xor_si128(_mm_cmpeq_epi16(d, _mm_setzero_si128()), _mm_set1_epi8(-1))
}

/// `|a - b|` per byte.
#[inline]
unsafe fn absdiff_epu8(a: __m128i, b: __m128i) -> __m128i {
    _mm_or_si128(_mm_subs_epu8(a, b), _mm_subs_epu8(b, a))
}

/// Byte select: `mask ? b : a` (mask bytes are 0x00 or 0xFF).
#[inline]
unsafe fn blendv_si128(a: __m128i, b: __m128i, mask: __m128i) -> __m128i {
    _mm_or_si128(_mm_andnot_si128(mask, a), _mm_and_si128(mask, b))
}

/// Vector half of [`super::threshold_diff`]. All slices must share a length
/// that is a multiple of 16.
///
/// # Safety
/// Caller guarantees the length precondition; loads/stores are unaligned.
pub(super) unsafe fn threshold_diff(
    reference: &[u8],
    virgin: &[u8],
    noise: u8,
    out: &mut [u8],
) -> usize {
    debug_assert_eq!(reference.len() % 16, 0);
    let noiserow = _mm_set1_epi8(noise as i8);
    let mut diffs = 0usize;

    for i in (0..reference.len()).step_by(16) {
        let refrow = _mm_loadu_si128(reference.as_ptr().add(i) as *const __m128i);
        let vgnrow = _mm_loadu_si128(virgin.as_ptr().add(i) as *const __m128i);
        let m = cmpgt_epu8(absdiff_epu8(refrow, vgnrow), noiserow);
        _mm_storeu_si128(out.as_mut_ptr().add(i) as *mut __m128i, m);
        diffs += (_mm_movemask_epi8(m) as u32).count_ones() as usize;
    }
    diffs
}

/// Vector half of [`super::update_reference`] for `RefAction::Update`.
/// All slices must share a length that is a multiple of 16; `threshold_ref`
/// and `accept_timer` must already be clamped (<= 0xFF / 0xFFFE).
///
/// # Safety
/// Caller guarantees the length precondition; loads/stores are unaligned.
#[allow(clippy::too_many_arguments)]
pub(super) unsafe fn update_reference(
    reference: &mut [u8],
    ref_age: &mut [u16],
    virgin: &[u8],
    smartmask: &[u8],
    out: &[u8],
    threshold_ref: u8,
    accept_timer: u16,
) {
    debug_assert_eq!(reference.len() % 16, 0);
    debug_assert!(accept_timer <= 0xFFFE);

    let zero = _mm_setzero_si128();
    let threshrow = _mm_set1_epi8(threshold_ref as i8);
    let accepttimerrow = _mm_set1_epi16(accept_timer as i16);

    for i in (0..reference.len()).step_by(16) {
        let mut refrow = _mm_loadu_si128(reference.as_ptr().add(i) as *const __m128i);
        let vgnrow = _mm_loadu_si128(virgin.as_ptr().add(i) as *const __m128i);

        // thresholdmask = |ref - virgin| > threshold_ref
        let thresholdmask = cmpgt_epu8(absdiff_epu8(refrow, vgnrow), threshrow);

        // includemask = thresholdmask && smartmask != 0
        let smartmaskzero = _mm_cmpeq_epi8(
            _mm_loadu_si128(smartmask.as_ptr().add(i) as *const __m128i),
            zero,
        );
        let includemask = _mm_andnot_si128(smartmaskzero, thresholdmask);

        // The sixteen u16 age counters for this row.
        let mut agelo = _mm_loadu_si128(ref_age.as_ptr().add(i) as *const __m128i);
        let mut agehi = _mm_loadu_si128(ref_age.as_ptr().add(i + 8) as *const __m128i);

        // 8-bit masks for age == 0 and age > accept_timer.
        let agezero = _mm_packs_epi16(
            _mm_cmpeq_epi16(agelo, zero),
            _mm_cmpeq_epi16(agehi, zero),
        );
        let agetimer = _mm_packs_epi16(
            cmpgt_epu16(agelo, accepttimerrow),
            cmpgt_epu16(agehi, accepttimerrow),
        );

        let outzero = _mm_cmpeq_epi8(
            _mm_loadu_si128(out.as_ptr().add(i) as *const __m128i),
            zero,
        );

        // age &= include && !(agezero || agetimer || outzero)
        let mut mask = _mm_andnot_si128(
            _mm_or_si128(_mm_or_si128(agezero, agetimer), outzero),
            includemask,
        );
        agelo = _mm_and_si128(agelo, _mm_unpacklo_epi8(mask, mask));
        agehi = _mm_and_si128(agehi, _mm_unpackhi_epi8(mask, mask));

        // include && !(agezero || agetimer) && outzero  ->  ref = avg(ref, virgin)
        mask = _mm_and_si128(
            _mm_andnot_si128(_mm_or_si128(agezero, agetimer), includemask),
            outzero,
        );
        refrow = blendv_si128(refrow, _mm_avg_epu8(refrow, vgnrow), mask);

        // include && !((agetimer || outzero) && !agezero)  ->  age += 1
        mask = _mm_andnot_si128(
            _mm_andnot_si128(agezero, _mm_or_si128(agetimer, outzero)),
            includemask,
        );
        let one = _mm_set1_epi16(1);
        agelo = _mm_adds_epu16(agelo, _mm_and_si128(one, _mm_unpacklo_epi8(mask, mask)));
        agehi = _mm_adds_epu16(agehi, _mm_and_si128(one, _mm_unpackhi_epi8(mask, mask)));

        _mm_storeu_si128(ref_age.as_mut_ptr().add(i) as *mut __m128i, agelo);
        _mm_storeu_si128(ref_age.as_mut_ptr().add(i + 8) as *mut __m128i, agehi);

        // !(include && !(agetimer && !agezero))  ->  ref = virgin
        mask = _mm_andnot_si128(_mm_andnot_si128(agezero, agetimer), includemask);
        refrow = blendv_si128(vgnrow, refrow, mask);

        _mm_storeu_si128(reference.as_mut_ptr().add(i) as *mut __m128i, refrow);
    }
}
