pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::{config_search_paths, load_config, Config};
pub use error::{Result, SocktapError};
pub use event::{Event, EventSink};
pub use types::{normalize, Domain, SysOutcome, SysRet};
