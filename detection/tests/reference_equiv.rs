//! Scalar vs SSE2 equivalence for the reference-update kernel.
//!
//! Mirrors the permutation harness the algorithm was originally validated
//! with: 41-byte strips over the cross product of smartmask state, output
//! state, virgin value, age and reference value, requiring byte-identical
//! reference and age planes from both paths.

#![cfg(target_arch = "x86_64")]

use vigil_detection::pixel::{threshold_diff, update_reference, KernelPath, RefAction};

const STRIP: usize = 41;

#[test]
fn update_reference_permutation_matches() {
    let mut virgin = [0u8; STRIP];
    let mut smartmask = [0u8; STRIP];
    let mut out = [0u8; STRIP];

    let mut ref_a = [0u8; STRIP];
    let mut ref_b = [0u8; STRIP];
    let mut age_a = [0u16; STRIP];
    let mut age_b = [0u16; STRIP];

    // noise 0 makes the include threshold 0; a second timer value
    // exercises the averaging and timeout arms as well.
    for accept_timer in [0u16, 3] {
        for sm in 0..2u8 {
            smartmask.fill(sm);
            for ov in 0..2u8 {
                out.fill(ov);
                for vbase in 0..256usize {
                    for (i, v) in virgin.iter_mut().enumerate() {
                        *v = (vbase + i) as u8;
                    }
                    for agebase in 0..10u16 {
                        for rbase in 0..256usize {
                            for i in 0..STRIP {
                                ref_a[i] = (rbase + i) as u8;
                                ref_b[i] = ref_a[i];
                                age_a[i] = agebase + i as u16;
                                age_b[i] = age_a[i];
                            }

                            update_reference(
                                KernelPath::Scalar,
                                RefAction::Update,
                                &mut ref_a,
                                &mut age_a,
                                &virgin,
                                &smartmask,
                                &out,
                                0,
                                accept_timer,
                            );
                            update_reference(
                                KernelPath::Sse2,
                                RefAction::Update,
                                &mut ref_b,
                                &mut age_b,
                                &virgin,
                                &smartmask,
                                &out,
                                0,
                                accept_timer,
                            );

                            assert_eq!(
                                ref_a, ref_b,
                                "ref mismatch: sm={} out={} vbase={} agebase={} rbase={} timer={}",
                                sm, ov, vbase, agebase, rbase, accept_timer
                            );
                            assert_eq!(
                                age_a, age_b,
                                "age mismatch: sm={} out={} vbase={} agebase={} rbase={} timer={}",
                                sm, ov, vbase, agebase, rbase, accept_timer
                            );
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn threshold_diff_paths_agree_on_noise_gradient() {
    // An odd length leaves a 13-byte tail for the scalar fallback.
    const N: usize = 16 * 37 + 13;
    let mut reference = vec![0u8; N];
    let mut virgin = vec![0u8; N];
    for i in 0..N {
        reference[i] = (i * 17) as u8;
        virgin[i] = (i * 17 + i / 3) as u8;
    }

    for noise in [0u8, 4, 51, 255] {
        let mut out_a = vec![0u8; N];
        let mut out_b = vec![0u8; N];
        let da = threshold_diff(KernelPath::Scalar, &reference, &virgin, noise, &mut out_a);
        let db = threshold_diff(KernelPath::Sse2, &reference, &virgin, noise, &mut out_b);
        assert_eq!(da, db, "count mismatch at noise {}", noise);
        assert_eq!(out_a, out_b, "plane mismatch at noise {}", noise);
        assert_eq!(da, out_a.iter().filter(|&&p| p != 0).count());
    }
}

#[test]
fn update_reference_idempotent_on_quiescent_frame() {
    const N: usize = 16 * 9 + 7;
    let virgin: Vec<u8> = (0..N).map(|i| (i * 31) as u8).collect();
    for path in [KernelPath::Scalar, KernelPath::Sse2] {
        let mut reference = virgin.clone();
        let mut age = vec![7u16; N];
        update_reference(
            path,
            RefAction::Update,
            &mut reference,
            &mut age,
            &virgin,
            &vec![255u8; N],
            &vec![0u8; N],
            8,
            100,
        );
        assert_eq!(reference, virgin);
        assert!(age.iter().all(|&a| a == 0));
    }
}
