pub mod motion;
pub mod scripted;
pub mod stub;

pub use motion::MotionBackend;
pub use scripted::{DetectionScript, ScriptedBackend, ScriptedTrack, Waypoint};
pub use stub::StubBackend;
