pub mod channel;
pub mod health;
pub mod notification;
pub mod status;
