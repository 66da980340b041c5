pub mod baseline;
pub mod enricher;
pub mod router;

pub use baseline::{ActorBaseline, BaselineDetector, BaselineSnapshot};
pub use enricher::{RiskAssessment, RiskEnricher};
pub use router::{Category, EventRouter};
