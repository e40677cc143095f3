pub mod sim;
pub mod traits;

pub use sim::SimulatedSurface;
pub use traits::{BrokeragePosition, BrokerageSurface, NavTarget, OrderPreview, SurfaceResponse};

#[cfg(test)]
pub use traits::MockBrokerageSurface;
