#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Prefix for generated container names (`{prefix}-{uuid}`).
    pub name_prefix: String,
    /// Seconds Docker waits for a graceful stop before killing.
    pub stop_timeout_secs: i64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            name_prefix: "evaluator".into(),
            stop_timeout_secs: 10,
        }
    }
}
