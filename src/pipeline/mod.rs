pub mod delivery;

pub use delivery::{DeliveryPolicy, EngineState, FrameDeliveryEngine, FrameReader, StatsSnapshot};
