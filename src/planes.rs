//! Selection of the plane sideband content is scanned out on

use drm::control::{crtc, plane, PlaneType};
use tracing::{debug, trace};

use crate::{
    config::ZposPriority,
    device::{access_error, plane_type, plane_zpos, KmsDevice, PropertyMap, Resources},
    error::Error,
};

/// An overlay plane reserved for sideband content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebandPlane {
    /// Plane handle
    pub handle: plane::Handle,
    /// Stacking order of the plane, if the driver exposes it
    pub zpos: Option<i32>,
    /// Properties of the plane
    pub props: PropertyMap,
}

/// Find the overlay plane of `crtc` best suited for sideband content.
///
/// Planes listed in `claimed` are in use by other outputs and are skipped.
/// Among the remaining overlay planes the one with the highest (or lowest,
/// depending on `priority`) zpos is picked, ties are resolved by driver order.
///
/// Returns `Ok(None)` if the crtc has no usable overlay plane.
#[profiling::function]
pub fn locate_sideband_plane<D: KmsDevice>(
    device: &D,
    resources: &Resources,
    crtc: crtc::Handle,
    claimed: &[plane::Handle],
    priority: ZposPriority,
) -> Result<Option<SidebandPlane>, Error> {
    let Some(crtc_index) = resources.crtc_index(crtc) else {
        debug!(?crtc, "crtc is not part of the device resources");
        return Ok(None);
    };

    let mut candidates = Vec::new();
    for handle in device
        .planes()
        .map_err(access_error(device, "Error loading plane resources"))?
    {
        if claimed.contains(&handle) {
            trace!(plane = ?handle, "skipping plane claimed by another output");
            continue;
        }
        let info = device
            .plane(handle)
            .map_err(access_error(device, "Error loading plane info"))?;
        if !info.possible_crtcs.contains_index(crtc_index) {
            continue;
        }
        let props = device
            .properties(handle)
            .map_err(access_error(device, "Error loading plane properties"))?;
        if plane_type(&props) != Some(PlaneType::Overlay) {
            trace!(plane = ?handle, "skipping non-overlay plane");
            continue;
        }
        let zpos = plane_zpos(&props);
        trace!(plane = ?handle, ?zpos, "found overlay plane");
        candidates.push(SidebandPlane { handle, zpos, props });
    }

    // min_by_key keeps the first of equal elements, which preserves driver order on ties
    let selected = match priority {
        ZposPriority::Highest => candidates
            .into_iter()
            .min_by_key(|p| std::cmp::Reverse(p.zpos.unwrap_or_default())),
        ZposPriority::Lowest => candidates.into_iter().min_by_key(|p| p.zpos.unwrap_or_default()),
    };

    match &selected {
        Some(plane) => debug!(?crtc, plane = ?plane.handle, zpos = ?plane.zpos, "selected sideband plane"),
        None => debug!(?crtc, "no overlay plane available"),
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use drm::control::PlaneType;

    use super::locate_sideband_plane;
    use crate::{
        config::ZposPriority,
        device::{test::FakeDevice, KmsDevice},
    };

    fn device() -> FakeDevice {
        FakeDevice::builder()
            .crtc(30)
            .crtc(31)
            .plane(40, &[30, 31], PlaneType::Primary, Some(0))
            .plane(41, &[30], PlaneType::Overlay, Some(1))
            .plane(42, &[30], PlaneType::Overlay, Some(3))
            .plane(43, &[30, 31], PlaneType::Overlay, Some(2))
            .plane(44, &[30], PlaneType::Cursor, Some(4))
            .build()
    }

    #[test]
    fn picks_by_zpos_priority() {
        let device = device();
        let res = device.resources().unwrap();
        let crtc = FakeDevice::crtc_handle(30);

        let highest = locate_sideband_plane(&device, &res, crtc, &[], ZposPriority::Highest)
            .unwrap()
            .unwrap();
        assert_eq!(highest.handle, FakeDevice::plane_handle(42));
        assert_eq!(highest.zpos, Some(3));

        let lowest = locate_sideband_plane(&device, &res, crtc, &[], ZposPriority::Lowest)
            .unwrap()
            .unwrap();
        assert_eq!(lowest.handle, FakeDevice::plane_handle(41));
    }

    #[test]
    fn respects_possible_crtcs_and_claims() {
        let device = device();
        let res = device.resources().unwrap();
        let crtc = FakeDevice::crtc_handle(31);

        let plane = locate_sideband_plane(&device, &res, crtc, &[], ZposPriority::Highest)
            .unwrap()
            .unwrap();
        assert_eq!(plane.handle, FakeDevice::plane_handle(43));

        let claimed = [FakeDevice::plane_handle(43)];
        assert!(locate_sideband_plane(&device, &res, crtc, &claimed, ZposPriority::Highest)
            .unwrap()
            .is_none());
    }

    #[test]
    fn unknown_crtc_has_no_plane() {
        let device = device();
        let res = device.resources().unwrap();
        assert!(
            locate_sideband_plane(&device, &res, FakeDevice::crtc_handle(99), &[], ZposPriority::Highest)
                .unwrap()
                .is_none()
        );
    }
}
