//! Mathematical utilities: special functions and small dense linear algebra.

pub mod linalg;
pub mod special;

pub use linalg::*;
pub use special::*;
