pub mod protocol;
pub mod regtype;
pub mod types;
