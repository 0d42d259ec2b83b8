//! Tools Foundations

mod token;

pub use token::*;
