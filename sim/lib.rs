#![deny(dead_code)]
#![deny(unused_imports)]

pub mod aggregate;
pub mod estimate;
pub mod fa;
pub mod generate;
pub mod grid;
pub mod reliability;
pub mod runner;
pub mod scores;
pub mod sem;
