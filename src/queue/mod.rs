//! The shared buffer queues behind the per-thread front ends.

pub(crate) mod nonblocking;
pub(crate) mod paused;

pub(crate) use self::nonblocking::NonblockingQueue;
pub(crate) use self::paused::PausedBuffers;
