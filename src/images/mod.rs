//! Checkpoint images directory

pub mod reader;

pub use reader::ImageDir;
