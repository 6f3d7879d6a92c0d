use clap::Parser;

use crate::config::Config;
use crate::protocol::DebugFlags;

#[derive(Debug, Parser)]
#[command(
    name = "cube-server",
    version,
    about = r#"
cube-server multiplexes client windows onto DRM-style display pipelines.

EXAMPLES:
    # Drive the first card, seat 0:
    cube-server --device /dev/dri/card0

    # Second instance on its own socket:
    cube-server --seat 1 --device /dev/dri/card1

    # No hardware, virtual heads (also used by the tests):
    cube-server --device headless
"#
)]
pub struct Opt {
    /// Server instance id; clients connect to /tmp/cube_server-<seat>.
    #[arg(short, long, default_value_t = 0)]
    pub seat: u32,

    /// Scanout device path, or "headless" for the built-in backend.
    #[arg(short, long, default_value = "/dev/dri/card0")]
    pub device: String,

    /// Pipe index the touch screen maps to.
    #[arg(short, long, default_value_t = 0)]
    pub touch_pipe: usize,

    /// Mouse acceleration factor.
    #[arg(short = 'a', long, default_value_t = 1.0)]
    pub mc_accel: f32,

    /// Eight comma-separated per-component debug levels
    /// (common,compositor,scanout,renderer,event,protocol,client,server).
    #[arg(long)]
    pub debug: Option<String>,
}

fn parse_debug(spec: &str) -> DebugFlags {
    let mut levels = [0u8; 8];
    for (slot, part) in levels.iter_mut().zip(spec.split(',')) {
        *slot = part.trim().parse().unwrap_or(0);
    }
    DebugFlags {
        common: levels[0],
        compositor: levels[1],
        scanout: levels[2],
        renderer: levels[3],
        event: levels[4],
        protocol: levels[5],
        client: levels[6],
        server: levels[7],
    }
}

impl Opt {
    pub fn config(&self) -> Config {
        Config {
            seat: self.seat,
            device: self.device.clone(),
            touch_pipe: self.touch_pipe,
            mouse_accel: self.mc_accel,
            debug: self.debug.as_deref().map(parse_debug).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_spec_parses_in_order() {
        let flags = parse_debug("1,2,3,4,5,6,7,8");
        assert_eq!(flags.common, 1);
        assert_eq!(flags.compositor, 2);
        assert_eq!(flags.server, 8);
    }

    #[test]
    fn short_and_partial_specs_default_to_zero() {
        let flags = parse_debug("0,9");
        assert_eq!(flags.compositor, 9);
        assert_eq!(flags.scanout, 0);
    }
}
