#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod bits;
pub mod collective;
pub mod config;
pub mod envelope;
pub mod epoch;
pub mod error;
pub mod event;
pub mod handler;
pub mod lb;
pub mod message;
pub mod messenger;
pub mod net;
pub mod node;
pub mod pipe;
pub mod pool;
pub mod runnable;
pub mod scheduler;
pub mod term;
pub mod trace;
pub mod tree;

pub mod prelude;

// Macro-generated handler registration (`handler::register!`) expands
// into `#[ctor::ctor]`-annotated statics; re-exported so downstream
// crates never need `ctor` as a direct dependency of their own.
pub use ctor;
