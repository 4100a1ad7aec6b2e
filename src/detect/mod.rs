mod backend;
mod backends;
mod registry;
mod result;
pub mod yolo;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{load_labels, BackendRegistry};
pub use result::{order_detections, BoundingBox, Detection, DetectionOrder};
