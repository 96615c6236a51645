pub mod agents;
pub mod exec;
pub mod login;
pub mod logs;
pub mod services;
