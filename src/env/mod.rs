//! Environment module - The reset/step/close contract
//!
//! This module provides:
//! - The [`Environment`] trait implemented by local and remote drivers
//! - Action, observation and step result types
//! - Wrappers that translate structured action spaces to flat ones

mod spaces;
mod traits;
mod wrappers;

pub use spaces::*;
pub use traits::*;
pub use wrappers::*;
