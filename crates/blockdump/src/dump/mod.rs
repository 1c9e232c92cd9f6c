//! Time-range dumps of a block database.
//!
//! A dump hard-links every sealed block overlapping the window and writes
//! the overlapping part of the head as one new block.
//!
//! ```text
//! Dumper::open  → catalog::discover → HeadManager::init(max block maxTime)
//! Dumper::dump  → Window::overlaps → extract::link_block → HeadManager::flush
//! ```

pub mod catalog;
pub mod dumper;
pub mod extract;
pub mod head;
pub mod range;

pub use catalog::{discover, Block};
pub use dumper::{DumpReport, Dumper};
pub use extract::{link_block, LinkedBlock};
pub use head::HeadManager;
pub use range::Window;
