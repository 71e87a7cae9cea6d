pub mod error;
pub mod import;
pub mod merge;
pub mod optout;
pub mod phone;
pub mod sse;
pub mod template;
