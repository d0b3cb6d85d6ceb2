//! The reactive store: state, reducer, actor loop, and subscriber fan-out.

pub mod actions;
pub mod engine;
pub mod reducer;
pub mod state;
pub mod subscriber;

pub use actions::*;
pub use engine::{EngineError, Store, StoreHandle};
pub use reducer::reduce;
pub use state::{EngineMode, EngineState, TerminalMode, UpdateSettings, WatchSettings};
pub use subscriber::{Subscriber, SubscriberId};
