mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{DetectionScript, MotionBackend, ScriptedBackend, StubBackend};
pub use registry::{BackendOptions, BackendRegistry};
pub use result::{BoundingBox, Detection, FrameDetections, ObjectClass};
