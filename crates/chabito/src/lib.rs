pub mod agent;
pub mod chat;
pub mod conversation;
pub mod db;
pub mod errors;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod tools;
