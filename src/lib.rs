pub mod config;
pub mod constants;
pub mod error;
pub mod gru;
pub mod pipeline;
#[cfg(test)]
pub mod test;
pub mod util {
    pub mod file_utils;
    pub mod model_logger;
    #[cfg(test)]
    pub mod test_utils;
}

/// Build-time information (crate name and version) recorded in checkpoints
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
