pub mod connection;
pub mod records;
pub mod schema;

pub use connection::*;
pub use records::RecordStore;
pub use schema::*;
