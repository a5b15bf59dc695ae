#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod api;
pub mod auth;
pub mod cancellation;
pub mod citations;
pub mod classifier;
pub mod constants;
pub mod decoder;
pub mod logging;
pub mod main_helper;
pub mod reducer;
pub mod session;
pub mod str_utils;
pub mod types;

pub use types::*;

pub use main_helper::Args;
pub use session::{ChatSession, TurnOutcome};
