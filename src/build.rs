pub const BUILD_VERSION: &str = env!("BUILD_VERSION");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

// (name, source) of every recipe bundled for the `builtin://` repo.
include!(concat!(env!("OUT_DIR"), "/builtin_recipes.rs"));
