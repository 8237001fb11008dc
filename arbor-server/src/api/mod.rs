//! Everything both ends of the wire agree on: framing, payload shapes and
//! the route table.

pub mod codec;
pub mod model;
pub mod routes;
