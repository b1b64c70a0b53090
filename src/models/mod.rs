pub mod command;
pub mod delivery;
pub mod drone;
pub mod event;
pub mod path;
pub mod weather;
