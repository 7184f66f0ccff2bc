pub mod accuracy;
pub mod events;
pub mod features;
pub mod metrics;
pub mod model;
pub mod observation;
pub mod prediction;

pub use accuracy::*;
pub use events::*;
pub use features::*;
pub use metrics::*;
pub use model::*;
pub use observation::*;
pub use prediction::*;
