//! Cooperative concurrency primitives for an embedded scripting runtime:
//! promises with synchronous handler chaining, an async wrapper for plain
//! functions, a single-threaded task executor with `await_promise`/`spawn`,
//! and named bounded channels whose operations complete through promises.
//!
//! ```
//! use strand_core::{Executor, Promise, StrandError};
//!
//! let executor = Executor::new();
//! let exec = executor.clone();
//! let doubled = executor.spawn_with(
//!     move |x: i32| async move {
//!         let base = exec.await_promise(Promise::resolve(x), None).await?;
//!         Ok::<_, StrandError>(base * 2)
//!     },
//!     21,
//! );
//! assert_eq!(executor.block_on(doubled), Ok(42));
//! ```

pub mod asyncify;
pub mod channel;
pub mod combinators;
pub mod config;
pub mod error;
pub mod future;
pub mod runtime;

pub use asyncify::asyncify;
pub use channel::{ChannelInfo, Registry, SelectCase, Selected};
pub use config::StrandConfig;
pub use error::{StrandError, StrandErrorType};
pub use future::{Awaitable, IntoPromise, Outcome, Promise, PromiseState, Resolver};
pub use runtime::{yield_now, AwaitPromise, Executor, Sleep, YieldNow};
