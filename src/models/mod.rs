pub mod event;
pub mod retrieval;
pub mod round;
