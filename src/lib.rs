pub mod error;
pub mod fastscan;
pub mod nand;
pub mod ubi;
