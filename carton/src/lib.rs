//! Overlay-backed container execution over OCI images.
//!
//! `carton` runs commands inside root filesystems pulled by
//! [`carton-oci`], using an overlayfs mount so the stored image stays
//! pristine while the container writes into a private upper layer.
//!
//! # Quick start
//!
//! ```no_run
//! use carton::Runtime;
//! use carton_oci::{Client, Layout, Puller};
//!
//! let layout = Layout::open().expect("no state directory");
//! let mut puller = Puller::new(&layout, Client::new());
//! let id = puller.pull("alpine:latest").expect("pull failed");
//!
//! let runtime = Runtime::new(&layout);
//! let report = runtime.run(&id, &["/bin/sh".into()]).expect("run failed");
//! runtime.teardown(&report.container_id).expect("teardown failed");
//! ```
//!
//! Mounting overlayfs requires Linux and (outside user namespaces)
//! root privileges; on other platforms only the error types are built.

#![allow(clippy::missing_docs_in_private_items)]

#[cfg(target_os = "linux")]
mod container;
mod error;
#[cfg(target_os = "linux")]
mod overlay;

#[cfg(target_os = "linux")]
pub use container::{RunReport, Runtime};
pub use error::{Error, Result};
