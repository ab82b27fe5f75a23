use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Wraps the external detection/tracking/feature model. A backend sees each
/// frame by shared reference only and returns owned detections.
///
/// Backends run either in-process on the inference stage thread or inside the
/// `vigil_infer_worker` process, so they must not assume anything about the
/// caller beyond sequential calls with strictly increasing frame sequences.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection (and tracking, when the backend tracks) on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
