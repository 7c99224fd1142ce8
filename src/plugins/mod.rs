pub mod backup;
pub mod board;
pub mod cache;
pub mod compose;
pub mod health;
pub mod proxy;
pub mod seed;
pub mod smoke;
