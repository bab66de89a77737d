mod app;
mod person;

pub use app::add_routes;
