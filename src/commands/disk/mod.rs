pub mod clean;
pub mod info;
pub mod uninstall;
