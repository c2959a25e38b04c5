// Shared utilities: logging format helpers, host detection, well-known paths.

pub mod logging;
pub mod os_detection;
pub mod path_resolver;
