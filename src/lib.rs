pub mod cli;
pub mod config;
pub mod database_ops;
pub mod logging;
pub mod normalization;
pub mod reconcile;

pub mod util {
    pub mod env;
    pub mod lock;
    pub mod retry;
}
