pub mod api;
pub mod context;
pub mod html;
pub mod runtime;

pub use context::Registration;
pub use runtime::{Recipe, anchor_pattern};
