#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Ambient support crate: logging and small utilities shared between
//! `vt-core` and the binaries that embed it.

pub mod logging;
pub mod time;
pub mod util;
