pub mod config;
pub mod conversation;
pub mod observer;
pub mod prompt;
pub mod reasoning_loop;
pub mod router;
pub mod runtime;
pub mod summarizer;
pub mod tool;
pub mod unit_tools;

pub use config::*;
pub use conversation::*;
pub use observer::*;
pub use prompt::*;
pub use reasoning_loop::*;
pub use router::*;
pub use runtime::*;
pub use summarizer::*;
pub use tool::*;
pub use unit_tools::*;
