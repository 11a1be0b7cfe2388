pub mod config;
pub mod run;
pub mod scan;
pub mod verify;

pub use config::config;
pub use run::run;
pub use scan::scan;
pub use verify::verify;
