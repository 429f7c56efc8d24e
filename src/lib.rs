pub mod addressing;
pub mod arith;
pub mod codegen;
pub mod common;
pub mod inst;
pub mod profile;
pub mod spec;
pub mod tiling;
