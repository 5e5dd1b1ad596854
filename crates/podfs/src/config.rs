//! Subsystem configuration.

use std::path::PathBuf;

use podfs_common::{PodPaths, UidRange};

use crate::filesystem::{Capabilities, HostPlatform};

/// Configuration for preparing pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodfsConfig {
    /// Paths for pod data.
    pub paths: PodPaths,
    /// Ownership mapping applied to replicated trees.
    pub uid_range: UidRange,
    /// Platform capabilities to use. `None` probes the host.
    pub capabilities: Option<Capabilities>,
}

impl Default for PodfsConfig {
    fn default() -> Self {
        Self {
            paths: PodPaths::new(),
            uid_range: UidRange::identity(),
            capabilities: None,
        }
    }
}

impl PodfsConfig {
    /// Create a rootless configuration under the user's home directory.
    ///
    /// Unprivileged users can neither create device nodes nor give files to
    /// other users, so both capabilities are disabled up front. Replicated
    /// entries are then owned by the invoking user.
    #[must_use]
    pub fn rootless() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        let root = home.join(".local/share/podfs");

        Self {
            paths: PodPaths::with_root(root),
            uid_range: UidRange::identity(),
            capabilities: Some(
                Capabilities::all()
                    .without_device_nodes()
                    .without_ownership(),
            ),
        }
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = PodPaths::with_root(root);
        self
    }

    /// Set the UID range.
    #[must_use]
    pub const fn with_uid_range(mut self, uid_range: UidRange) -> Self {
        self.uid_range = uid_range;
        self
    }

    /// Use fixed capabilities instead of probing the host.
    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Builds the platform bindings for this configuration.
    #[must_use]
    pub fn platform(&self) -> HostPlatform {
        self.capabilities
            .map_or_else(HostPlatform::detect, HostPlatform::with_capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::Platform;

    #[test]
    fn default_config() {
        let config = PodfsConfig::default();
        assert!(!config.uid_range.is_shifted());
        assert!(config.capabilities.is_none());
    }

    #[test]
    fn rootless_config() {
        let config = PodfsConfig::rootless();
        assert!(config.paths.root.ends_with(".local/share/podfs"));
        let caps = config.platform().capabilities();
        assert!(!caps.device_nodes);
        assert!(!caps.ownership);
        assert!(caps.fifos);
    }

    #[test]
    fn builder() {
        let config = PodfsConfig::default()
            .with_root("/custom/root")
            .with_uid_range(UidRange::new(100_000, 65_536))
            .with_capabilities(Capabilities::all());

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.uid_range, UidRange::new(100_000, 65_536));
        assert_eq!(config.platform().capabilities(), Capabilities::all());
    }
}
