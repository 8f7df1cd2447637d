pub mod config;
pub mod fixture;
pub mod har;
pub mod logging;
pub mod normalize;
pub mod postman;
pub mod reconcile;
pub mod resolver;
pub mod responder;
pub mod scenario;
pub mod server;
pub mod store;
pub mod trace;
