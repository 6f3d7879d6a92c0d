use std::path::PathBuf;

use crate::protocol::DebugFlags;

/// Runtime configuration, fixed at startup except for the debug levels,
/// which the shell command may overwrite while running.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server instance id; selects the socket path.
    pub seat: u32,
    /// Scanout device path, or `headless`.
    pub device: String,
    /// Pipe the touch screen's absolute coordinates map onto.
    pub touch_pipe: usize,
    /// Mouse acceleration factor.
    pub mouse_accel: f32,
    pub debug: DebugFlags,
}

impl Config {
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/cube_server-{}", self.seat))
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            seat: 0,
            device: "/dev/dri/card0".to_string(),
            touch_pipe: 0,
            mouse_accel: 1.0,
            debug: DebugFlags::default(),
        }
    }
}
