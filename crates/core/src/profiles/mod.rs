//! Profile models, contracts, and lookups.

mod profiles_lookup;
mod profiles_model;
mod profiles_traits;

pub use profiles_lookup::*;
pub use profiles_model::*;
pub use profiles_traits::*;
