// API endpoint handlers

pub mod health;
pub mod proxy;
pub mod session;
