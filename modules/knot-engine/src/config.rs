use typed_builder::TypedBuilder;

/// Options shared by every knot. Consumed once at build/compose time.
///
/// ```
/// use knot_engine::KnotConfig;
///
/// let config = KnotConfig::builder().name("profile").trace_changes(true).build();
/// assert_eq!(config.name, "profile");
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct KnotConfig {
    /// Name recorded on the tracing span of every pipeline task.
    #[builder(default = String::from("knot"), setter(into))]
    pub name: String,
    /// Log every reduced change at debug level.
    #[builder(default)]
    pub trace_changes: bool,
}

impl Default for KnotConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = KnotConfig::default();
        assert_eq!(config.name, "knot");
        assert!(!config.trace_changes);
    }
}
