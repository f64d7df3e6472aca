pub mod input;
pub mod network;
pub mod page;
pub mod target;
