pub mod inject;
pub mod resolve;
pub mod schema;
