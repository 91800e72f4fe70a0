pub mod backend;
pub mod point;
pub mod worker;
