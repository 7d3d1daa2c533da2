//! Loop device operations (losetup).

use crate::HalResult;

pub trait LoopOps {
    /// Ask the kernel for the first unused loop device (e.g. `/dev/loop3`).
    ///
    /// Nothing is attached; the generated script binds the image to it later.
    fn find_free_loop(&self) -> HalResult<String>;
}
