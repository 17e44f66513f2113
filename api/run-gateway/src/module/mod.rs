pub mod run;
pub mod stream;
