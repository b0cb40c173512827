//! Table access. One repository per table; only `printers` exists today.

pub mod printer;
