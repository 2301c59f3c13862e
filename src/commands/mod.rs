pub mod common;
pub mod run;
pub mod proj;
pub mod template;
