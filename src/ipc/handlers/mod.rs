pub mod attendance;
pub mod core;
pub mod marks;
pub mod roster;
pub mod setup;
