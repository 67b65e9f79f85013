// vim: tw=80
//! Sparing and copy engine for RAID virtual drives
//!
//! A virtual drive sits between a RAID group and one physical drive.  When
//! that drive fails, or is predicted to fail, the virtual drive temporarily
//! becomes a two-way mirror, copies the data onto a spare, and then drops the
//! old drive.  This crate decides when to ask for a spare, validates each
//! step of the swap, drives the copy, and keeps the persistent checkpoints
//! consistent throughout.

#![cfg_attr(feature = "nightly", feature(plugin))]

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

pub mod checkpoint;
pub mod config;
pub mod config_mode;
pub mod copy;
pub mod edge;
pub mod flags;
pub mod mem;
pub mod metadata;
pub mod monitor;
pub mod nonpaged;
pub mod notify;
pub mod raid_group;
pub mod services;
pub mod swap;
pub mod timer;
pub mod types;
pub mod validation;
pub mod virtual_drive;

pub use crate::types::*;
