pub mod key_management;
pub mod party;
