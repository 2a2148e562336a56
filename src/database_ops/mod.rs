pub mod db;
pub mod gallery;
pub mod models;
pub mod postgres;
pub mod sqlite;
