pub mod entities;
pub mod layout;
pub mod types;
