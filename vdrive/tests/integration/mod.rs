// vim: tw=80
//! Tests that run the `vdrive` binary

mod util;
mod vdrive;
