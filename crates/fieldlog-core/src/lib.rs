//! Hardware-independent core library for the fieldlog data logger
//!
//! This crate contains the platform-agnostic logic of a battery-powered field
//! logger: the sleep/wake scheduler, the resilient append-only CSV log store,
//! the asynchronous probe conversion channel and the acquisition cycle that ties
//! them together. Hardware is reached only through the collaborator traits
//! ([`time::ClockSource`], [`storage::Medium`], [`sensors::Sensor`],
//! [`sensors::ConversionSensor`], [`scheduler::Platform`], [`display::StatusDisplay`]).
//!
//! It is `no_std` with `extern crate alloc` so it compiles on both embedded
//! targets and desktop hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod acquisition;
pub mod boot;
pub mod config;
pub mod display;
pub mod reading;
pub mod scheduler;
pub mod sensors;
pub mod storage;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;
