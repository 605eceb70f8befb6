pub mod global_counter;
pub mod options;
pub mod safepoint;
pub mod suspendible;

pub use self::options::RefinementOptions;
pub use self::safepoint::{SafepointId, SafepointTracker};
pub use self::suspendible::{NeverYield, SuspendibleThreadSet, YieldFlag};
