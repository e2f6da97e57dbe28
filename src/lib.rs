//! swepool - a worker-pool dispatcher for Swiss Ephemeris RPC subprocesses.
//!
//! Runs N identical `swerker-stdio`-style worker processes behind one
//! dispatcher. Calls are marshalled as length-prefixed binary frames over
//! each worker's stdin, replies are read off its stdout, and stderr is
//! scanned for `DEBUG:`/`ERROR:` panic diagnostics. A crashed worker is
//! retired and replaced in its pool slot without stalling the others;
//! the caller whose call triggered the crash gets the crash error, and
//! nothing is retried.
//!
//! # Example
//!
//! ```rust,no_run
//! use swepool::{Call, Dispatcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = Dispatcher::builder("/usr/local/bin/swerker-stdio")
//!         .num_workers(4)
//!         .data_path(["/usr/share/ephe"])
//!         .build()
//!         .await?;
//!
//!     let func = pool.index_for_name("swe_version").expect("function missing");
//!     let reply = pool.dispatch(Call::new(func)).await?;
//!     println!("version reply: {} payload bytes", reply.len());
//!
//!     pool.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! The payload bytes inside a frame are msgpack; the dispatcher treats
//! them as opaque except for the first byte, which distinguishes an
//! in-band error map from a successful result.

mod call;
mod catalog;
mod diag;
mod dispatcher;
mod error;
mod frame;
mod payload;
mod worker;

pub use call::{Call, CtxCall};
pub use catalog::Catalog;
pub use diag::{DiagnosticScanner, WorkerError};
pub use dispatcher::{version, Builder, Dispatcher};
pub use error::{Error, Result};
pub use frame::{read_frame, FrameWriter};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
