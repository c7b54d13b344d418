//! Xvfb virtual display
//!
//! Headful browsing on servers needs an X display. We spawn an `Xvfb`
//! child and hand its display name to the browser launch (`--display=:N`).

use std::process::{Child, Command, Stdio};
use tracing::{info, warn};

/// X display number used for the pool's Xvfb instance.
const DISPLAY_NUMBER: u32 = 99;

/// Running Xvfb child process.
pub struct VirtualDisplay {
    child: Option<Child>,
    display: String,
}

impl VirtualDisplay {
    /// Spawn Xvfb for the given screen size.
    pub fn start(size: (u32, u32)) -> std::io::Result<Self> {
        let display_name = format!(":{DISPLAY_NUMBER}");
        let (width, height) = size;
        let child = Command::new("Xvfb")
            .arg(&display_name)
            .args(["-screen", "0", &format!("{width}x{height}x24")])
            .arg("-nolisten")
            .arg("tcp")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        info!("Started virtual display {display_name} ({width}x{height})");
        Ok(Self {
            child: Some(child),
            display: display_name,
        })
    }

    /// Display name for the browser launch, e.g. `:99`.
    #[must_use]
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Kill the Xvfb process. Idempotent; errors are logged and swallowed.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                warn!("Failed to kill Xvfb: {e}");
            }
            let _ = child.wait();
            info!("Stopped virtual display {}", self.display);
        }
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        self.stop();
    }
}
