//! Read-only host information.

use crate::HalResult;

pub trait HostInfoOps {
    /// True when running with an effective uid of 0.
    fn is_root(&self) -> bool;

    /// Machine hardware name as reported by `uname -m`.
    fn machine(&self) -> HalResult<String>;
}
