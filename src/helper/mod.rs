//! Helper subprocess pool (spec.md §3 "Helper server"/"Helper pool", §4.2).
//!
//! Grounded on `examples/original_source/src/helper.cc`/`helper.h`: a named
//! pool of external child processes fed newline-terminated request lines and
//! read back newline-terminated replies, with per-child concurrency, a
//! shared overflow queue, timeout/retry, and an overload policy. The source
//! drives this off `comm::Read`/`comm::Write` callbacks registered on raw
//! pipe FDs; `tokio::process::Child` plus one reader task per child is the
//! idiomatic equivalent — the reader task *is* the registered read callback,
//! just expressed as a loop instead of a re-arming callback.

pub mod pool;

pub use pool::{HelperPool, HelperPoolConfig, HelperReply, HelperReplyKind, OverloadPolicy, SubmitError};
