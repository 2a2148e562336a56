pub mod api;
pub mod cli;
pub mod config;
pub mod database_ops;
pub mod logging;
pub mod orchestrator;

pub mod util {
    pub mod env;
}
