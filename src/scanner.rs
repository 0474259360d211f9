//! Detection of the display topology behind each output
//!
//! - [`probe`] force-probes every connector of the device once,
//! - [`scan_output`] turns a probe into the [`TopologyState`] of a single output, including
//!   the sideband plane of its active crtc,
//! - [`needs_redetect`] compares the cached topology against the current connector
//!   states without probing.

use drm::control::{connector, crtc, plane};
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use crate::{
    config::SidebandConfig,
    device::{access_error, ConnectorInfo, CrtcMask, DisplayMode, KmsDevice, Resources},
    error::Error,
    output::{ModeInfo, Output, OutputId, OutputStatus, PanelOrientation, TopologyState},
    planes::locate_sideband_plane,
};

/// Connector states of a device at a single point in time
#[derive(Debug, Clone)]
pub struct Probe {
    /// Modesetting resources
    pub resources: Resources,
    /// Every connector, in driver order
    pub connectors: Vec<ConnectorInfo>,
}

/// Query the resources of the device and force-probe all connectors
#[profiling::function]
pub fn probe<D: KmsDevice>(device: &D) -> Result<Probe, Error> {
    let resources = device
        .resources()
        .map_err(access_error(device, "Error loading drm resources"))?;
    let connectors = resources
        .connectors
        .iter()
        .map(|conn| device.connector(*conn, true))
        .collect::<Result<Vec<_>, _>>()
        .map_err(access_error(device, "Error loading connector info"))?;
    trace!("probed {} connectors", connectors.len());
    Ok(Probe { resources, connectors })
}

/// Build the topology of output `id` from a probe.
///
/// `claimed` lists planes already selected by other outputs.
/// On error nothing is returned, leaving it to the caller to keep the previous state.
#[profiling::function]
pub fn scan_output<D: KmsDevice>(
    device: &D,
    probe: &Probe,
    id: OutputId,
    config: &SidebandConfig,
    claimed: &[plane::Handle],
) -> Result<TopologyState, Error> {
    let mut mode_infos = Vec::new();
    for conn in probe
        .connectors
        .iter()
        .filter(|conn| config.routing.output_for(conn.interface) == Some(id))
    {
        mode_infos.push(mode_info(device, &probe.resources, conn)?);
    }

    let active = mode_infos.iter().position(ModeInfo::is_active);
    let mut plane = None;
    if let Some(idx) = active {
        let info = &mut mode_infos[idx];
        if let Some(crtc) = info.crtc {
            plane = locate_sideband_plane(device, &probe.resources, crtc, claimed, config.zpos_priority)?;
            info.plane = plane.as_ref().map(|p| p.handle);
        }
    }

    let status = if active.is_some() {
        OutputStatus::Connected
    } else {
        OutputStatus::Disconnected
    };
    debug!(
        output = ?id,
        ?status,
        connectors = mode_infos.len(),
        plane = ?plane.as_ref().map(|p| p.handle),
        "scanned output"
    );

    Ok(TopologyState {
        status,
        mode_infos,
        active,
        plane,
    })
}

fn mode_info<D: KmsDevice>(device: &D, resources: &Resources, conn: &ConnectorInfo) -> Result<ModeInfo, Error> {
    let props = device
        .properties(conn.handle)
        .map_err(access_error(device, "Error loading connector properties"))?;
    let orientation = props
        .get("panel orientation")
        .map(|entry| PanelOrientation::from_raw(entry.value))
        .unwrap_or_default();

    let mut possible_crtcs = CrtcMask::default();
    for encoder in &conn.encoders {
        let info = device
            .encoder(*encoder)
            .map_err(access_error(device, "Error loading encoder info"))?;
        possible_crtcs.0 |= info.possible_crtcs.0;
    }

    let (crtc, mode) = current_pipe(device, resources, conn)?;

    Ok(ModeInfo {
        connector: conn.handle,
        connector_name: conn.name(),
        state: conn.state,
        encoder: conn.current_encoder,
        crtc,
        mode,
        props,
        possible_crtcs,
        plane: None,
        orientation,
    })
}

/// Crtc driven by a connected connector through its current encoder, and the mode of that crtc
fn current_pipe<D: KmsDevice>(
    device: &D,
    resources: &Resources,
    conn: &ConnectorInfo,
) -> Result<(Option<crtc::Handle>, Option<DisplayMode>), Error> {
    if conn.state != connector::State::Connected {
        return Ok((None, None));
    }
    let Some(encoder) = conn.current_encoder else {
        return Ok((None, None));
    };
    let info = device
        .encoder(encoder)
        .map_err(access_error(device, "Error loading encoder info"))?;
    match info.crtc {
        Some(handle) if resources.crtc_index(handle).is_some() => {
            let mode = device
                .crtc(handle)
                .map_err(access_error(device, "Error loading crtc info"))?
                .mode;
            Ok((Some(handle), mode))
        }
        Some(handle) => {
            warn!(connector = ?conn.handle, crtc = ?handle, "encoder reports unknown crtc");
            Ok((None, None))
        }
        None => Ok((None, None)),
    }
}

/// Returns true if the cached topology of `outputs` is stale.
///
/// Connectors are queried without forcing a probe, so this is cheap enough to be
/// called before every commit.
pub fn needs_redetect<D: KmsDevice>(
    device: &D,
    outputs: &IndexMap<OutputId, Output>,
    config: &SidebandConfig,
) -> Result<bool, Error> {
    if outputs
        .values()
        .any(|output| output.topology.status == OutputStatus::Undetected)
    {
        return Ok(true);
    }

    let resources = device
        .resources()
        .map_err(access_error(device, "Error loading drm resources"))?;
    let mut routed = 0;
    for handle in &resources.connectors {
        let conn = device
            .connector(*handle, false)
            .map_err(access_error(device, "Error loading connector info"))?;
        let Some(output) = config
            .routing
            .output_for(conn.interface)
            .and_then(|id| outputs.get(&id))
        else {
            continue;
        };
        routed += 1;
        let known = output
            .topology
            .mode_infos
            .iter()
            .find(|info| info.connector == conn.handle);
        let Some(info) = known.filter(|info| info.state == conn.state) else {
            debug!(connector = ?conn.handle, state = ?conn.state, "connector changed");
            return Ok(true);
        };
        if info.encoder != conn.current_encoder {
            debug!(connector = ?conn.handle, encoder = ?conn.current_encoder, "encoder changed");
            return Ok(true);
        }
        let (crtc, mode) = current_pipe(device, &resources, &conn)?;
        if info.crtc != crtc || info.mode != mode {
            debug!(connector = ?conn.handle, ?crtc, ?mode, "crtc or mode changed");
            return Ok(true);
        }
    }

    let known = outputs.values().map(|o| o.topology.mode_infos.len()).sum::<usize>();
    Ok(routed != known)
}

#[cfg(test)]
mod tests {
    use drm::control::connector::{Interface, State};
    use indexmap::IndexMap;

    use super::{needs_redetect, probe, scan_output};
    use crate::{
        config::SidebandConfig,
        device::test::FakeDevice,
        output::{Output, OutputId, OutputStatus, PanelOrientation},
    };

    fn outputs(device: &FakeDevice, config: &SidebandConfig) -> IndexMap<OutputId, Output> {
        let probe = probe(device).unwrap();
        let mut outputs = IndexMap::new();
        let mut claimed = Vec::new();
        for id in config.routing.outputs() {
            let mut output = Output::new(id);
            output.topology = scan_output(device, &probe, id, config, &claimed).unwrap();
            claimed.extend(output.topology.plane.as_ref().map(|p| p.handle));
            outputs.insert(id, output);
        }
        outputs
    }

    #[test]
    fn connected_output_gets_plane() {
        let device = FakeDevice::single_output(1920, 1080);
        let config = SidebandConfig::default();
        let probe = probe(&device).unwrap();

        let topology = scan_output(&device, &probe, OutputId::PRIMARY, &config, &[]).unwrap();
        assert_eq!(topology.status, OutputStatus::Connected);
        assert_eq!(topology.crtc(), Some(FakeDevice::crtc_handle(30)));
        assert_eq!(topology.mode().map(|m| m.size), Some((1920, 1080)));

        let info = topology.active_mode_info().unwrap();
        assert_eq!(info.connector_name, "HDMI-A-1");
        assert_eq!(info.plane, Some(FakeDevice::plane_handle(41)));
        assert!(info.possible_crtcs.contains_index(0));
        assert_eq!(topology.plane.as_ref().map(|p| p.handle), info.plane);

        // nothing routed to the external output
        let external = scan_output(&device, &probe, OutputId::EXTERNAL, &config, &[]).unwrap();
        assert_eq!(external.status, OutputStatus::Disconnected);
        assert!(external.mode_infos.is_empty());
        assert!(external.plane.is_none());
    }

    #[test]
    fn connector_without_mode_is_disconnected() {
        let device = FakeDevice::single_output(1920, 1080);
        device.set_crtc_mode(30, None);
        let config = SidebandConfig::default();
        let probe = probe(&device).unwrap();

        let topology = scan_output(&device, &probe, OutputId::PRIMARY, &config, &[]).unwrap();
        assert_eq!(topology.status, OutputStatus::Disconnected);
        assert_eq!(topology.mode_infos.len(), 1);
        assert!(topology.plane.is_none());
    }

    #[test]
    fn reads_panel_orientation() {
        let device = FakeDevice::builder()
            .crtc_with_mode(30, (800, 1280))
            .encoder(20, Some(30), &[30])
            .connector(10, Interface::DSI, State::Connected, &[20], Some(20))
            .connector_property(10, "panel orientation", 1)
            .plane(41, &[30], drm::control::PlaneType::Overlay, Some(1))
            .build();
        let probe = probe(&device).unwrap();
        let topology = scan_output(&device, &probe, OutputId::PRIMARY, &SidebandConfig::default(), &[]).unwrap();
        assert_eq!(
            topology.active_mode_info().map(|info| info.orientation),
            Some(PanelOrientation::UpsideDown)
        );
    }

    #[test]
    fn redetect_after_hotplug() {
        let device = FakeDevice::dual_output();
        let config = SidebandConfig::default();
        let outputs = outputs(&device, &config);

        // each output got its own plane
        let planes = outputs
            .values()
            .filter_map(|o| o.topology.plane.as_ref().map(|p| p.handle))
            .collect::<Vec<_>>();
        assert_eq!(planes.len(), 2);
        assert_ne!(planes[0], planes[1]);

        assert!(!needs_redetect(&device, &outputs, &config).unwrap());
        device.set_connector_state(11, State::Disconnected);
        assert!(needs_redetect(&device, &outputs, &config).unwrap());
    }

    #[test]
    fn redetect_after_mode_change() {
        let device = FakeDevice::single_output(1920, 1080);
        let config = SidebandConfig::default();
        let outputs = outputs(&device, &config);
        assert!(!needs_redetect(&device, &outputs, &config).unwrap());

        device.set_crtc_mode(30, Some((1280, 720)));
        assert!(needs_redetect(&device, &outputs, &config).unwrap());

        device.set_crtc_mode(30, Some((1920, 1080)));
        assert!(!needs_redetect(&device, &outputs, &config).unwrap());
        device.set_crtc_mode(30, None);
        assert!(needs_redetect(&device, &outputs, &config).unwrap());
    }

    #[test]
    fn undetected_output_needs_detection() {
        let device = FakeDevice::single_output(1920, 1080);
        let config = SidebandConfig::default();
        let mut outputs = outputs(&device, &config);
        outputs.insert(OutputId(2), Output::new(OutputId(2)));
        assert!(needs_redetect(&device, &outputs, &config).unwrap());
    }
}
