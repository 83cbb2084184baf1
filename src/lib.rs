//! Concurrent bastion-tunnelled SSH command execution across a VM fleet.

pub mod fleet;
