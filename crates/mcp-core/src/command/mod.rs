//! The command protocol: types, parsing and serialization.
//!
//! ```text
//! create:list:abc123{"title":"Groceries"}
//! └─┬──┘ └┬─┘ └─┬──┘ └────────┬────────┘
//! action  │  target_id   parameters (optional JSON object)
//!    target_type
//! ```

pub mod parser;
mod types;

pub use parser::{extract_basic_info, parse, serialize, validate_target_id};
pub use types::*;
