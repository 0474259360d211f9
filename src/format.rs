//! Translation of allocator pixel formats to drm fourcc codes
//!
//! Buffers handed to the sideband path are described with the pixel format
//! identifiers of the buffer allocator (HAL formats). The display driver only
//! understands fourcc codes, so every registration goes through [`drm_format`].
//!
//! Only format *identifiers* are translated, pixel data is never touched.

use std::fmt;

use drm_fourcc::DrmFourcc;

/// Pixel format identifier used by the buffer allocator
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HalFormat(pub u32);

#[allow(missing_docs)]
impl HalFormat {
    pub const RGBA_8888: HalFormat = HalFormat(0x1);
    pub const RGBX_8888: HalFormat = HalFormat(0x2);
    pub const RGB_888: HalFormat = HalFormat(0x3);
    pub const RGB_565: HalFormat = HalFormat(0x4);
    pub const BGRA_8888: HalFormat = HalFormat(0x5);
    pub const YCBCR_422_SP: HalFormat = HalFormat(0x10);
    pub const YCRCB_420_SP: HalFormat = HalFormat(0x11);
    pub const YCRCB_NV12: HalFormat = HalFormat(0x15);
    pub const YCRCB_NV12_10: HalFormat = HalFormat(0x17);
    pub const YCBCR_422_SP_10: HalFormat = HalFormat(0x18);
    pub const IMPLEMENTATION_DEFINED: HalFormat = HalFormat(0x22);
    pub const YCBCR_420_888: HalFormat = HalFormat(0x23);
    pub const YV12: HalFormat = HalFormat(0x3231_5659);
}

impl fmt::Debug for HalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            HalFormat::RGBA_8888 => "RGBA_8888",
            HalFormat::RGBX_8888 => "RGBX_8888",
            HalFormat::RGB_888 => "RGB_888",
            HalFormat::RGB_565 => "RGB_565",
            HalFormat::BGRA_8888 => "BGRA_8888",
            HalFormat::YCBCR_422_SP => "YCbCr_422_SP",
            HalFormat::YCRCB_420_SP => "YCrCb_420_SP",
            HalFormat::YCRCB_NV12 => "YCrCb_NV12",
            HalFormat::YCRCB_NV12_10 => "YCrCb_NV12_10",
            HalFormat::YCBCR_422_SP_10 => "YCbCr_422_SP_10",
            HalFormat::IMPLEMENTATION_DEFINED => "IMPLEMENTATION_DEFINED",
            HalFormat::YCBCR_420_888 => "YCbCr_420_888",
            HalFormat::YV12 => "YV12",
            HalFormat(other) => return write!(f, "HalFormat({:#x})", other),
        };
        f.write_str(name)
    }
}

/// The video source a sideband buffer originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InputType {
    /// Frames produced by the hardware video decoder
    #[default]
    Decoder,
    /// Frames captured by the hdmi receiver
    HdmiIn,
}

impl InputType {
    /// Format used by buffers of this source whose allocator format is
    /// [`HalFormat::IMPLEMENTATION_DEFINED`]
    pub fn implementation_defined_format(self) -> HalFormat {
        match self {
            InputType::Decoder => HalFormat::YCRCB_NV12,
            InputType::HdmiIn => HalFormat::YCBCR_422_SP,
        }
    }
}

/// A raw drm fourcc code
///
/// Unlike [`DrmFourcc`] this can also carry vendor specific codes,
/// that are not part of the upstream format list.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourccCode(pub u32);

/// 10-bit packed NV12, rockchip extension (`NA12`)
pub const NV12_10: FourccCode = FourccCode::from_chars(*b"NA12");
/// 10-bit packed NV16, rockchip extension (`NA16`)
pub const NV16_10: FourccCode = FourccCode::from_chars(*b"NA16");

impl FourccCode {
    /// Build a fourcc code from its four characters
    pub const fn from_chars(c: [u8; 4]) -> FourccCode {
        FourccCode(c[0] as u32 | (c[1] as u32) << 8 | (c[2] as u32) << 16 | (c[3] as u32) << 24)
    }

    /// Returns the upstream fourcc, if this code is a known upstream format
    pub fn as_fourcc(self) -> Option<DrmFourcc> {
        DrmFourcc::try_from(self.0).ok()
    }
}

impl From<DrmFourcc> for FourccCode {
    fn from(fourcc: DrmFourcc) -> Self {
        FourccCode(fourcc as u32)
    }
}

impl fmt::Debug for FourccCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(
                f,
                "{}{}{}{}",
                bytes[0] as char, bytes[1] as char, bytes[2] as char, bytes[3] as char
            )
        } else {
            write!(f, "FourccCode({:#x})", self.0)
        }
    }
}

/// Translate an allocator pixel format into the drm format used for scan-out.
///
/// Returns `None` for every format without a drm counterpart, including
/// [`HalFormat::IMPLEMENTATION_DEFINED`], which needs to be resolved via
/// [`InputType::implementation_defined_format`] first.
pub fn drm_format(format: HalFormat) -> Option<FourccCode> {
    let fourcc = match format {
        HalFormat::RGB_888 => DrmFourcc::Bgr888,
        HalFormat::BGRA_8888 => DrmFourcc::Argb8888,
        HalFormat::RGBX_8888 => DrmFourcc::Xbgr8888,
        HalFormat::RGBA_8888 => DrmFourcc::Abgr8888,
        HalFormat::RGB_565 => DrmFourcc::Bgr565,
        HalFormat::YV12 => DrmFourcc::Yvu420,
        HalFormat::YCBCR_422_SP => DrmFourcc::Nv16,
        HalFormat::YCRCB_420_SP => DrmFourcc::Nv21,
        HalFormat::YCRCB_NV12 | HalFormat::YCBCR_420_888 => DrmFourcc::Nv12,
        HalFormat::YCRCB_NV12_10 => return Some(NV12_10),
        HalFormat::YCBCR_422_SP_10 => return Some(NV16_10),
        _ => return None,
    };
    Some(fourcc.into())
}

/// Translate the format of a buffer produced by the given source.
pub fn drm_format_for_input(format: HalFormat, input: InputType) -> Option<FourccCode> {
    if format == HalFormat::IMPLEMENTATION_DEFINED {
        drm_format(input.implementation_defined_format())
    } else {
        drm_format(format)
    }
}

#[cfg(test)]
mod tests {
    use drm_fourcc::DrmFourcc;

    use super::{drm_format, drm_format_for_input, FourccCode, HalFormat, InputType, NV12_10};

    const KNOWN: &[HalFormat] = &[
        HalFormat::RGBA_8888,
        HalFormat::RGBX_8888,
        HalFormat::RGB_888,
        HalFormat::RGB_565,
        HalFormat::BGRA_8888,
        HalFormat::YCBCR_422_SP,
        HalFormat::YCRCB_420_SP,
        HalFormat::YCRCB_NV12,
        HalFormat::YCRCB_NV12_10,
        HalFormat::YCBCR_422_SP_10,
        HalFormat::YCBCR_420_888,
        HalFormat::YV12,
    ];

    #[test]
    fn known_formats_are_stable() {
        for format in KNOWN {
            let first = drm_format(*format);
            assert!(first.is_some(), "{:?} should translate", format);
            assert_eq!(first, drm_format(*format));
        }
    }

    #[test]
    fn unknown_formats_have_no_drm_format() {
        for raw in [0u32, 0x6, 0x12, 0x22, 0x100, 0xdead_beef] {
            assert_eq!(drm_format(HalFormat(raw)), None, "{:#x}", raw);
        }
    }

    #[test]
    fn yuv_mapping() {
        assert_eq!(drm_format(HalFormat::YCRCB_NV12), Some(DrmFourcc::Nv12.into()));
        assert_eq!(drm_format(HalFormat::YV12), Some(DrmFourcc::Yvu420.into()));
        assert_eq!(drm_format(HalFormat::YCRCB_NV12_10), Some(NV12_10));
        assert_eq!(NV12_10.as_fourcc(), None);
        assert_eq!(format!("{:?}", NV12_10), "NA12");
    }

    #[test]
    fn implementation_defined_follows_input() {
        assert_eq!(
            drm_format_for_input(HalFormat::IMPLEMENTATION_DEFINED, InputType::Decoder),
            Some(FourccCode::from(DrmFourcc::Nv12))
        );
        assert_eq!(
            drm_format_for_input(HalFormat::IMPLEMENTATION_DEFINED, InputType::HdmiIn),
            Some(FourccCode::from(DrmFourcc::Nv16))
        );
        assert_eq!(
            drm_format_for_input(HalFormat::RGBA_8888, InputType::HdmiIn),
            drm_format(HalFormat::RGBA_8888)
        );
    }
}
