pub mod api;
pub mod error;
pub mod ids;
pub mod model;
pub mod schema;
pub mod value;

pub use api::*;
pub use error::{StrataError, StrataResult};
pub use ids::*;
pub use model::*;
pub use schema::*;
pub use value::*;
