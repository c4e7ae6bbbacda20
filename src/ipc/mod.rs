//! inter-process communication: counting semaphores and byte pipes
//!
//! both kinds of resource live in kernel-wide tables and are named by ids.
//! tasks hold ids, never the resources themselves; fork bumps a reference
//! count for each inherited id and exit drops it, so a resource survives
//! exactly as long as some task that can name it

pub mod pipe;
pub mod sem;

pub use pipe::{Pipe, PipeId, PIPE_BUFFER_SIZE};
pub use sem::{SemId, Semaphore};
