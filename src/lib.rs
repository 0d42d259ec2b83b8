//! Prim cache population for [OpenUSD](https://github.com/PixarAnimationStudios/OpenUSD) style scene description, in pure Rust

pub mod ar;
pub mod base;
pub mod pcp;
pub mod sdf;

#[doc(hidden)]
pub use base::*;
