pub mod alsa;
mod backoff;
pub mod bus;
mod error;
mod events;
pub mod native;
mod normalize;

pub use backoff::Backoff;
pub use events::*;
pub use normalize::EventNormalizer;
