pub mod account_ownership;
pub mod key_ownership;
