//! Configuration of the sideband renderer
//!
//! All knobs have defaults matching common rockchip-style vop hardware.
//! Some of them can be overridden through environment variables, see [`SidebandConfig::from_env`].

use std::{path::PathBuf, time::Duration};

use drm::control::connector::Interface;
use tracing::{info, warn};

use crate::output::OutputId;

/// Which plane to prefer, if multiple overlay planes are usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZposPriority {
    /// Pick the top-most plane
    #[default]
    Highest,
    /// Pick the bottom-most plane
    Lowest,
}

/// Margins applied to the display area before scaling, in percent of the mode size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Overscan {
    /// Left margin
    pub left: u8,
    /// Top margin
    pub top: u8,
    /// Right margin
    pub right: u8,
    /// Bottom margin
    pub bottom: u8,
}

impl Overscan {
    /// Same margin on every edge
    pub fn uniform(percent: u8) -> Overscan {
        Overscan {
            left: percent,
            top: percent,
            right: percent,
            bottom: percent,
        }
    }
}

/// Assignment of connectors to outputs by interface type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRouting {
    routes: Vec<(OutputId, Vec<Interface>)>,
}

impl Default for OutputRouting {
    fn default() -> Self {
        OutputRouting {
            routes: vec![
                (
                    OutputId::PRIMARY,
                    vec![
                        Interface::HDMIA,
                        Interface::EmbeddedDisplayPort,
                        Interface::DSI,
                        Interface::LVDS,
                        Interface::DPI,
                    ],
                ),
                (
                    OutputId::EXTERNAL,
                    vec![
                        Interface::DisplayPort,
                        Interface::HDMIB,
                        Interface::VGA,
                        Interface::DVII,
                        Interface::DVID,
                        Interface::DVIA,
                        Interface::TV,
                        Interface::Composite,
                        Interface::SVideo,
                        Interface::Component,
                    ],
                ),
            ],
        }
    }
}

impl OutputRouting {
    /// Routing without any assignments
    pub fn empty() -> OutputRouting {
        OutputRouting { routes: Vec::new() }
    }

    /// Route connectors of the given interfaces to `output`
    ///
    /// Interfaces already routed elsewhere are moved to `output`.
    pub fn route(mut self, output: OutputId, interfaces: impl IntoIterator<Item = Interface>) -> Self {
        let interfaces = interfaces.into_iter().collect::<Vec<_>>();
        for (_, routed) in self.routes.iter_mut() {
            routed.retain(|iface| !interfaces.contains(iface));
        }
        match self.routes.iter_mut().find(|(id, _)| *id == output) {
            Some((_, routed)) => routed.extend(interfaces),
            None => self.routes.push((output, interfaces)),
        }
        self
    }

    /// Output connectors of the given interface belong to
    pub fn output_for(&self, interface: Interface) -> Option<OutputId> {
        self.routes
            .iter()
            .find(|(_, routed)| routed.contains(&interface))
            .map(|(id, _)| *id)
    }

    /// All outputs with at least one routed interface, in routing order
    pub fn outputs(&self) -> impl Iterator<Item = OutputId> + '_ {
        self.routes.iter().map(|(id, _)| *id)
    }
}

/// Configuration of a [`SidebandRenderer`](crate::SidebandRenderer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebandConfig {
    /// Drm node opened by [`initialize`](crate::SidebandRenderer::initialize)
    pub device_path: PathBuf,
    /// Maximum number of outputs tracked
    pub max_outputs: usize,
    /// Duration commits are suppressed for after a mode change
    pub skip_frame_window: Duration,
    /// Plane selection policy
    pub zpos_priority: ZposPriority,
    /// Maximum number of cached framebuffers
    pub framebuffer_cache_capacity: usize,
    /// Optional overscan compensation
    pub overscan: Option<Overscan>,
    /// Connector to output assignment
    pub routing: OutputRouting,
}

/// Upper bound of outputs the hardware composer exposes
pub const MAX_OUTPUTS: usize = 4;

/// Default skip-frame window
pub const SKIP_FRAME_WINDOW: Duration = Duration::from_secs(2);

impl Default for SidebandConfig {
    fn default() -> Self {
        SidebandConfig {
            device_path: PathBuf::from("/dev/dri/card0"),
            max_outputs: MAX_OUTPUTS,
            skip_frame_window: SKIP_FRAME_WINDOW,
            zpos_priority: ZposPriority::default(),
            framebuffer_cache_capacity: 32,
            overscan: None,
            routing: OutputRouting::default(),
        }
    }
}

impl SidebandConfig {
    /// Default configuration with environment overrides applied
    ///
    /// - `SIDEBAND_DRM_DEVICE` - path of the drm node
    /// - `SIDEBAND_SKIP_FRAME_MS` - skip-frame window in milliseconds
    /// - `SIDEBAND_ZPOS` - `highest` or `lowest`
    /// - `SIDEBAND_FB_CACHE` - framebuffer cache capacity
    pub fn from_env() -> SidebandConfig {
        let mut config = SidebandConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("SIDEBAND_DRM_DEVICE") {
            info!("SIDEBAND_DRM_DEVICE is set. Using {}.", path);
            self.device_path = PathBuf::from(path);
        }
        if let Some(ms) = var("SIDEBAND_SKIP_FRAME_MS") {
            match ms.trim().parse::<u64>() {
                Ok(ms) => self.skip_frame_window = Duration::from_millis(ms),
                Err(err) => warn!("Ignoring invalid SIDEBAND_SKIP_FRAME_MS `{}`: {}", ms, err),
            }
        }
        if let Some(zpos) = var("SIDEBAND_ZPOS") {
            match zpos.trim().to_lowercase().as_str() {
                "highest" | "high" | "top" => self.zpos_priority = ZposPriority::Highest,
                "lowest" | "low" | "bottom" => self.zpos_priority = ZposPriority::Lowest,
                other => warn!("Ignoring invalid SIDEBAND_ZPOS `{}`", other),
            }
        }
        if let Some(capacity) = var("SIDEBAND_FB_CACHE") {
            match capacity.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => self.framebuffer_cache_capacity = capacity,
                _ => warn!("Ignoring invalid SIDEBAND_FB_CACHE `{}`", capacity),
            }
        }
    }

    /// Use the given drm node
    pub fn with_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_path = path.into();
        self
    }

    /// Change the skip-frame window
    pub fn with_skip_frame_window(mut self, window: Duration) -> Self {
        self.skip_frame_window = window;
        self
    }

    /// Change the plane selection policy
    pub fn with_zpos_priority(mut self, priority: ZposPriority) -> Self {
        self.zpos_priority = priority;
        self
    }

    /// Change the framebuffer cache capacity
    pub fn with_framebuffer_cache_capacity(mut self, capacity: usize) -> Self {
        self.framebuffer_cache_capacity = capacity;
        self
    }

    /// Enable overscan compensation
    pub fn with_overscan(mut self, overscan: Overscan) -> Self {
        self.overscan = Some(overscan);
        self
    }

    /// Replace the connector routing
    pub fn with_routing(mut self, routing: OutputRouting) -> Self {
        self.routing = routing;
        self
    }

    /// Change the number of tracked outputs
    pub fn with_max_outputs(mut self, max_outputs: usize) -> Self {
        self.max_outputs = max_outputs;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use drm::control::connector::Interface;

    use super::{OutputRouting, SidebandConfig, ZposPriority};
    use crate::output::OutputId;

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SIDEBAND_DRM_DEVICE", "/dev/dri/card1"),
            ("SIDEBAND_SKIP_FRAME_MS", "500"),
            ("SIDEBAND_ZPOS", "Lowest"),
            ("SIDEBAND_FB_CACHE", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = SidebandConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.device_path.to_str(), Some("/dev/dri/card1"));
        assert_eq!(config.skip_frame_window, Duration::from_millis(500));
        assert_eq!(config.zpos_priority, ZposPriority::Lowest);
        // invalid values keep the default
        assert_eq!(config.framebuffer_cache_capacity, 32);
    }

    #[test]
    fn rerouting_moves_interfaces() {
        let routing = OutputRouting::default().route(OutputId::EXTERNAL, [Interface::HDMIA]);
        assert_eq!(routing.output_for(Interface::HDMIA), Some(OutputId::EXTERNAL));
        assert_eq!(routing.output_for(Interface::DSI), Some(OutputId::PRIMARY));
        assert_eq!(OutputRouting::empty().output_for(Interface::HDMIA), None);
    }
}
