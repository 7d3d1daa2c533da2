//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for host operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod fake_hal;
pub mod guards;
pub mod host_info_ops;
pub mod linux_hal;
pub mod loop_ops;
pub mod probe_ops;
pub mod process_ops;

pub use fake_hal::{FakeHal, Operation};
pub use guards::CleanupGuard;
pub use host_info_ops::HostInfoOps;
pub use linux_hal::LinuxHal;
pub use loop_ops::LoopOps;
pub use probe_ops::{BinaryStatus, ProbeOps};
pub use process_ops::ProcessOps;

/// Complete HAL combining all host operation traits.
pub trait BuildHal: ProcessOps + LoopOps + HostInfoOps + ProbeOps + Send + Sync {}

/// Automatically implement BuildHal for any type implementing all required traits.
impl<T> BuildHal for T where T: ProcessOps + LoopOps + HostInfoOps + ProbeOps + Send + Sync {}
