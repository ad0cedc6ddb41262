pub mod admin;
pub mod category;
pub mod comment;
pub mod db;
pub mod engagement;
pub mod filesystem;
pub mod mail;
pub mod middleware;
pub mod orm;
pub mod post;
pub mod settings;
pub mod user;
pub mod web;

pub use crate::db::{get_db_pool, init_db};
