pub mod csv;
pub mod resources;
pub mod rows;

pub use self::csv::{CsvOptions, TableRows};
pub use resources::{DataDir, InputResource, ResourceLookup};
pub use rows::{AddressListRows, Row, RowSource};
