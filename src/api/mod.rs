// Read API over stored posts plus manual sync control

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
