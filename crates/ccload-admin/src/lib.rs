pub mod csv_io;
pub mod router;

pub use router::{AdminState, router};
