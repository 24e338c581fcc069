mod app;
mod invocation;

pub use app::add_routes;
