pub mod consensus;
pub mod many;
pub mod one;
