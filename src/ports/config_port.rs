//! Configuration access port trait.

/// Raw INI values; parsing and range checks happen in `EngineConfig`.
pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
}
