pub mod media;
pub mod notify;
pub mod rounds;
pub mod samsara;
pub mod slug_bug;
pub mod vision;
