pub mod content_id;
pub mod error;
pub mod pack_id;

pub use content_id::ContentId;
pub use error::{CairnError, Result};
pub use pack_id::PackId;
