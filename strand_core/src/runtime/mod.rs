mod executor;
mod task;
mod timer;
mod yield_now;

pub use executor::*;
pub use timer::{AwaitPromise, Sleep};
pub use yield_now::*;
