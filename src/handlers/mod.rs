pub mod health;
pub mod diagnostics;
pub mod page;

pub use health::*;
pub use diagnostics::*;
pub use page::*;
