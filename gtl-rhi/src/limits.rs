//! Backend-independent constants and pure helpers.

/// Sentinel meaning "from offset to the end of the resource".
pub const WHOLE_SIZE: u64 = !0u64;

pub const MAX_TIMESTAMP_QUERIES: u32 = 32;
pub const MAX_DESCRIPTOR_SET_COUNT: u32 = 4;
pub const MAX_PUSH_CONSTANTS_SIZE: u32 = 128;

/// Size of the largest math primitive (vec4 of f64); lets the compiler emit
/// wide loads and keeps every buffer fillable with `cmd_fill_buffer`
/// (which requires a multiple of 4).
pub const BUFFER_BASE_ALIGNMENT: u64 = 32;

/// Inline command-buffer updates are capped by the backend.
pub(crate) const MAX_BUFFER_UPDATE_SIZE: u64 = 65536;

pub const VENDOR_ID_AMD: u32 = 0x1002;
pub const VENDOR_ID_NVIDIA: u32 = 0x10DE;
pub const VENDOR_ID_INTEL: u32 = 0x8086;
pub const VENDOR_ID_MESA: u32 = 0x10005;

pub(crate) fn vendor_name(vendor_id: u32) -> Option<&'static str> {
    match vendor_id {
        VENDOR_ID_AMD => Some("AMD"),
        VENDOR_ID_NVIDIA => Some("NVIDIA"),
        VENDOR_ID_INTEL => Some("Intel"),
        VENDOR_ID_MESA => Some("Mesa"),
        _ => None,
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// One region of the shader binding table as reported to the trace call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtLayout {
    pub rgen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub buffer_size: u64,
}

/// SBT layout rules: strides are the handle size aligned to the handle
/// alignment, region sizes round up to the group base alignment, and the
/// ray-gen region's size must equal its stride.
pub(crate) fn compute_sbt_layout(
    handle_size: u32,
    handle_alignment: u32,
    base_alignment: u32,
    miss_count: u32,
    hit_count: u32,
) -> SbtLayout {
    let aligned_handle_size = align_up(handle_size as u64, handle_alignment as u64);
    let base_alignment = base_alignment as u64;

    let rgen_stride = align_up(aligned_handle_size, base_alignment);
    let rgen = SbtRegion {
        offset: 0,
        stride: rgen_stride,
        size: rgen_stride,
    };
    let miss = SbtRegion {
        offset: rgen.size,
        stride: aligned_handle_size,
        size: align_up(miss_count as u64 * aligned_handle_size, base_alignment),
    };
    let hit = SbtRegion {
        offset: rgen.size + miss.size,
        stride: aligned_handle_size,
        size: align_up(hit_count as u64 * aligned_handle_size, base_alignment),
    };

    SbtLayout {
        rgen,
        miss,
        hit,
        buffer_size: rgen.size + miss.size + hit.size,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AdapterKind {
    Discrete,
    Virtual,
    Other,
}

/// Candidates with errors score 0 and are never selectable.
pub(crate) fn score_device(kind: AdapterKind, device_local_heap_size: u64, has_errors: bool) -> u32 {
    if has_errors {
        return 0;
    }

    let mut score = match kind {
        AdapterKind::Discrete => 10000,
        // can be a masked dGPU
        AdapterKind::Virtual => 8000,
        AdapterKind::Other => 0,
    };

    score += (device_local_heap_size / (1024 * 1024 * 1024)) as u32;
    score
}

/// Applies the `GTL_DEVICE_INDEX_OVERRIDE` value, clamped to the candidate
/// range.
pub(crate) fn resolve_device_index_override(value: &str, candidate_count: usize) -> usize {
    let parsed: i64 = value.parse().unwrap_or(0);
    parsed.clamp(0, candidate_count as i64 - 1) as usize
}

/// All BLAS referenced by a TLAS must be opaque for the TLAS geometry to
/// carry the OPAQUE flag.
pub(crate) fn all_opaque(blas_opacity: &[bool]) -> bool {
    blas_opacity.iter().all(|opaque| *opaque)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
    }

    #[test]
    fn sbt_layout_matches_handle_math() {
        // handleSize 32, handleAlignment 32, baseAlignment 64, 2 miss, 3 hit
        let layout = compute_sbt_layout(32, 32, 64, 2, 3);

        assert_eq!(layout.rgen.stride, 64);
        assert_eq!(layout.rgen.size, 64);
        assert_eq!(layout.miss.stride, 32);
        assert_eq!(layout.miss.size, 64);
        assert_eq!(layout.hit.stride, 32);
        assert_eq!(layout.hit.size, 128);
        assert_eq!(layout.buffer_size, 256);

        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.hit.offset, 128);
    }

    #[test]
    fn sbt_rgen_size_equals_stride() {
        for (hs, ha, ba) in [(16u32, 16u32, 64u32), (32, 64, 64), (64, 64, 128)] {
            let layout = compute_sbt_layout(hs, ha, ba, 1, 1);
            assert_eq!(layout.rgen.size, layout.rgen.stride);
            assert_eq!(layout.rgen.size % ba as u64, 0);
        }
    }

    #[test]
    fn discrete_beats_integrated() {
        let discrete = score_device(AdapterKind::Discrete, 8 << 30, false);
        let integrated = score_device(AdapterKind::Other, 64 << 30, false);
        assert!(discrete > integrated);
    }

    #[test]
    fn errors_zero_the_score() {
        assert_eq!(score_device(AdapterKind::Discrete, 8 << 30, true), 0);
    }

    #[test]
    fn heap_size_breaks_ties() {
        let small = score_device(AdapterKind::Discrete, 4 << 30, false);
        let large = score_device(AdapterKind::Discrete, 24 << 30, false);
        assert!(large > small);
    }

    #[test]
    fn device_index_override_clamps() {
        assert_eq!(resolve_device_index_override("999", 2), 1);
        assert_eq!(resolve_device_index_override("-3", 2), 0);
        assert_eq!(resolve_device_index_override("1", 2), 1);
        assert_eq!(resolve_device_index_override("garbage", 2), 0);
    }

    #[test]
    fn tlas_opacity_requires_all_blas_opaque() {
        assert!(all_opaque(&[true, true]));
        assert!(!all_opaque(&[true, false]));
        assert!(all_opaque(&[]));
    }
}
