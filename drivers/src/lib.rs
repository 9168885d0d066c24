//! A user-space IPv4 stack running on cooperative threads.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod net;
pub mod random;

#[cfg(test)]
mod testbed;

#[cfg(test)]
mod arp_tests;
#[cfg(test)]
mod dhcp_tests;
#[cfg(test)]
mod loopback_tests;
#[cfg(test)]
mod tcp_data_tests;
