//! A dynamic resource allocation driver for VFIO PCI passthrough devices.
//!
//! The driver is split across two processes that never share memory: a
//! cluster-level allocation controller and a per-node device agent. The only
//! channel between them is a versioned, per-node [`resource::NodeDeviceState`]
//! record held by the Kubernetes API server, written with optimistic
//! concurrency on both sides.
//!
//! The [`controller::Controller`] implements the scheduling hooks consumed by
//! the cluster scheduler: it filters candidate nodes for pending claims,
//! stages tentative device selections, and commits bindings into the shared
//! record. The [`plugin::DeviceAgent`] runs on each node: it discovers the
//! passthrough-capable PCI devices, advertises them through the shared
//! record, and prepares or unprepares the Container Device Interface
//! descriptors that grant workloads access to the concrete devices.

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod plugin;
pub mod resource;

#[doc(inline)]
pub use controller::Controller;
#[doc(inline)]
pub use plugin::DeviceAgent;

#[cfg(test)]
mod protocol_test;
