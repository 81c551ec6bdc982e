pub mod htmx;
pub mod jwt;
pub mod visitor;
