pub mod codec;
pub mod header;
pub mod index;
pub mod memo;
pub mod options;
pub mod schema;
pub mod table;
