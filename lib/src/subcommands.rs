pub use client::*;
pub use lower::*;
pub use server::*;

pub mod client;
pub mod lower;
pub mod server;
