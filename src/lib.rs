//! Turns qcow2 cloud images into compressed OVA appliances.
//!
//! The pipeline validates the host, acquires the source image, converts
//! it to a raw disk of the requested size, grows the data partition and
//! its filesystem through a loop device, customizes the guest in a
//! chroot, and packages the result as a gzip-compressed OVA.
//!
//! # Architecture
//!
//! ```text
//! job (ConversionJob::run)
//!     │
//!     ├── preflight   host validation before anything mutates
//!     ├── acquire     URL fetch or local copy into the workdir
//!     ├── convert     qemu-img qcow2 -> raw, then resize
//!     ├── loopdev     loop binding + partition discovery
//!     ├── fsgrow      growpart + per-filesystem resize
//!     ├── customize   mounts, chroot, guest setup script
//!     ├── ova         descriptor/metadata rendering + tar
//!     └── compress    streaming gzip of the finished archive
//! ```
//!
//! Every external tool goes through [`process::Invoker`], so the whole
//! pipeline is testable without root against a recording fake. Host-wide
//! resources (loop devices, mounts, the working directory) are released
//! in strict LIFO order on both the success and the failure path; see
//! [`cleanup::ReleaseStack`] and [`customize::mounts::MountStack`].

pub mod acquire;
pub mod cleanup;
pub mod compress;
pub mod convert;
pub mod customize;
pub mod error;
pub mod fsgrow;
pub mod job;
pub mod loopdev;
pub mod ova;
pub mod preflight;
pub mod process;
pub mod templates;

pub use error::{Error, Result};
pub use job::{ConversionJob, Distro, JobConfig};
pub use process::{HostInvoker, Invoker};
