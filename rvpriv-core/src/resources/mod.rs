//! Memory resources that can back a hart's physical address space.

pub mod ram;

pub use ram::Ram;
