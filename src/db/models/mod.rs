pub mod session;

pub use session::{CameraSession, FrontRearHint, SessionFinalization, SessionSource};
