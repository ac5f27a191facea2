pub mod backend;
pub mod config;
pub mod dashboard;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod filer;
pub mod logging;
pub mod scheduler;
pub mod shutdown;
pub mod status;
