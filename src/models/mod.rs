pub mod health;
pub mod ready;
pub mod diagnostics;

pub use health::*;
pub use ready::*;
pub use diagnostics::*;
