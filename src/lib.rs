pub mod constants;
pub mod error;
pub mod pipeline;
pub mod seq2seq;
#[cfg(test)]
pub mod test;
pub mod util {
    pub mod model_logger;
    pub mod model_utils;
    #[cfg(test)]
    pub mod test_utils;
}

/// Build metadata generated by `build.rs`
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
