pub mod credential;
pub mod event;
pub mod exchange;
pub mod identifier;
pub mod key_state;
pub mod notification;
pub mod operation;
